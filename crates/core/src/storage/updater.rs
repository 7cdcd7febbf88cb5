//! Transactional application of a merged artifact set to local storage.
//!
//! Stores expose plain CRUD with no transactions, so the updater provides its
//! own: take a fresh snapshot as backup, apply the minimal set of operations,
//! re-read and validate, and put the backup back if anything is off. After a
//! failed update the store holds exactly what it held before.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, error, info, warn};

use super::{create, remove, snapshot, ArtifactStore};
use crate::errors::StorageError;
use crate::models::{Artifact, ArtifactKind};

/// Operations needed to turn one snapshot into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    pub deletes: Vec<Artifact>,
    /// `(current, target)` pairs; the paths differ for a detected rename.
    pub updates: Vec<(Artifact, Artifact)>,
    pub adds: Vec<Artifact>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.updates.is_empty() && self.adds.is_empty()
    }
}

/// Counts of what an applied update changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl UpdateReport {
    pub fn total(&self) -> usize {
        self.added + self.updated + self.deleted
    }
}

/// Stateless backup/apply/validate/rollback driver.
pub struct SafeStorageUpdater;

impl SafeStorageUpdater {
    /// Compute the operations that bring `current` to `target`.
    ///
    /// Paths are matched first. Among the leftovers, a current and a target
    /// artifact that are the only ones sharing a kind, name and originating
    /// file are treated as a move and planned as one update.
    pub fn plan(current: &[Artifact], target: &[Artifact]) -> UpdatePlan {
        let current_by_path: BTreeMap<&str, &Artifact> =
            current.iter().map(|a| (a.full_path(), a)).collect();
        let target_paths: HashSet<&str> = target.iter().map(|a| a.full_path()).collect();

        let mut plan = UpdatePlan::default();
        let mut unmatched_targets = Vec::new();

        for t in target {
            match current_by_path.get(t.full_path()) {
                Some(c) if is_same(c, t) => {}
                Some(c) => plan.updates.push(((*c).clone(), t.clone())),
                None => unmatched_targets.push(t),
            }
        }
        let unmatched_current: Vec<&Artifact> = current
            .iter()
            .filter(|c| !target_paths.contains(c.full_path()))
            .collect();

        let current_keys = unique_by_identity(&unmatched_current);
        let target_keys = unique_by_identity(&unmatched_targets);
        let mut moved: HashSet<&str> = HashSet::new();
        for t in unmatched_targets {
            let matched = target_keys
                .get(&identity(t))
                .and_then(|_| current_keys.get(&identity(t)));
            match matched {
                Some(c) => {
                    debug!(from = c.full_path(), to = t.full_path(), "planning move as update");
                    moved.insert(c.full_path());
                    plan.updates.push(((*c).clone(), t.clone()));
                }
                None => plan.adds.push(t.clone()),
            }
        }

        plan.deletes = unmatched_current
            .into_iter()
            .filter(|c| !moved.contains(c.full_path()))
            .cloned()
            .collect();

        // Children before parents on the way out, parents first on the way in.
        plan.deletes.sort_by_key(|a| std::cmp::Reverse(depth(a)));
        plan.adds.sort_by(|a, b| {
            (kind_rank(a), depth(a), a.full_path()).cmp(&(kind_rank(b), depth(b), b.full_path()))
        });
        plan
    }

    /// Bring `store` to exactly `target`.
    ///
    /// On any failure the pre-update snapshot is restored and
    /// [`StorageError::ValidationFailed`] is returned; `restored` says whether
    /// that restore itself succeeded.
    pub fn apply(store: &dyn ArtifactStore, target: &[Artifact]) -> Result<UpdateReport, StorageError> {
        let backup = snapshot(store)?;
        let plan = Self::plan(&backup, target);
        if plan.is_empty() {
            debug!("storage already matches target");
            return Ok(UpdateReport::default());
        }

        info!(
            deletes = plan.deletes.len(),
            updates = plan.updates.len(),
            adds = plan.adds.len(),
            "applying storage update"
        );

        let outcome = execute(store, &plan).and_then(|()| validate(store, target));
        match outcome {
            Ok(()) => {
                let report = UpdateReport {
                    added: plan.adds.len(),
                    updated: plan.updates.len(),
                    deleted: plan.deletes.len(),
                };
                info!(changes = report.total(), "storage update applied");
                Ok(report)
            }
            Err(err) => {
                error!(error = %err, "storage update failed, restoring backup");
                let restored = match Self::restore(store, &backup) {
                    Ok(()) => true,
                    Err(restore_err) => {
                        error!(error = %restore_err, "backup restore failed");
                        false
                    }
                };
                Err(StorageError::ValidationFailed {
                    detail: err.to_string(),
                    restored,
                })
            }
        }
    }

    /// Replace the store's contents with `backup`.
    pub fn restore(store: &dyn ArtifactStore, backup: &[Artifact]) -> Result<(), StorageError> {
        let mut present = snapshot(store)?;
        present.sort_by_key(|a| std::cmp::Reverse(depth(a)));
        for artifact in &present {
            remove(store, artifact)?;
        }

        let mut ordered: Vec<&Artifact> = backup.iter().collect();
        ordered.sort_by(|a, b| (kind_rank(a), depth(a)).cmp(&(kind_rank(b), depth(b))));
        for artifact in ordered {
            create(store, artifact)?;
        }
        warn!(count = backup.len(), "storage restored from backup");
        Ok(())
    }
}

fn execute(store: &dyn ArtifactStore, plan: &UpdatePlan) -> Result<(), StorageError> {
    for artifact in &plan.deletes {
        remove(store, artifact)?;
    }
    // Delete-then-recreate: not every backend has an atomic upsert.
    for (current, target) in &plan.updates {
        remove(store, current)?;
        create(store, target)?;
    }
    for artifact in &plan.adds {
        create(store, artifact)?;
    }
    Ok(())
}

fn validate(store: &dyn ArtifactStore, target: &[Artifact]) -> Result<(), StorageError> {
    let after = snapshot(store)?;
    if after.len() != target.len() {
        return Err(StorageError::Backend(format!(
            "expected {} artifacts after update, found {}",
            target.len(),
            after.len()
        )));
    }

    let after_by_path: HashMap<&str, &Artifact> = after.iter().map(|a| (a.full_path(), a)).collect();
    for t in target {
        match after_by_path.get(t.full_path()) {
            Some(a) if a.content_eq(t) => {}
            Some(_) => {
                return Err(StorageError::Backend(format!(
                    "content mismatch at {} after update",
                    t.full_path()
                )))
            }
            None => {
                return Err(StorageError::Backend(format!(
                    "{} missing after update",
                    t.full_path()
                )))
            }
        }
    }
    Ok(())
}

/// Exact equality, so order and timestamp changes are written too.
fn is_same(a: &Artifact, b: &Artifact) -> bool {
    a == b
}

type Identity<'a> = (ArtifactKind, &'a str, Option<&'a str>);

fn identity(a: &Artifact) -> Identity<'_> {
    let file_name = a.as_snippet().and_then(|s| s.file_name.as_deref());
    (a.kind(), a.name(), file_name)
}

/// Identities carried by exactly one artifact in `items`.
fn unique_by_identity<'a>(items: &[&'a Artifact]) -> HashMap<Identity<'a>, &'a Artifact> {
    let mut seen: HashMap<Identity<'a>, Option<&'a Artifact>> = HashMap::new();
    for a in items {
        seen.entry(identity(a))
            .and_modify(|slot| *slot = None)
            .or_insert(Some(*a));
    }
    seen.into_iter()
        .filter_map(|(k, v)| v.map(|a| (k, a)))
        .collect()
}

fn depth(a: &Artifact) -> usize {
    a.full_path().matches('/').count()
}

fn kind_rank(a: &Artifact) -> u8 {
    match a.kind() {
        ArtifactKind::Directory => 0,
        ArtifactKind::Snippet => 1,
    }
}
