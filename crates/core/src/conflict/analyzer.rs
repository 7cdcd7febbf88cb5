//! Change analysis between a baseline snapshot and a target snapshot.
//!
//! Produces a [`ChangeSet`] classifying every path as added, modified,
//! deleted or unchanged. Pure and deterministic: outputs are sorted by path.

use std::collections::HashMap;

use tracing::debug;

use crate::models::Artifact;

/// A path whose content differs between baseline and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub full_path: String,
    pub baseline: Artifact,
    pub target: Artifact,
}

/// Classified delta between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<Artifact>,
    pub modified: Vec<Modification>,
    pub deleted: Vec<Artifact>,
    pub unchanged: Vec<Artifact>,
}

impl ChangeSet {
    /// True when nothing was added, modified or deleted.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed paths.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// The change recorded for `path`, if any.
    pub fn change_for(&self, path: &str) -> Option<PathChange<'_>> {
        if let Some(a) = self.added.iter().find(|a| a.full_path() == path) {
            return Some(PathChange::Added(a));
        }
        if let Some(m) = self.modified.iter().find(|m| m.full_path == path) {
            return Some(PathChange::Modified(m));
        }
        self.deleted
            .iter()
            .find(|d| d.full_path() == path)
            .map(PathChange::Deleted)
    }

    /// Iterate every changed path with its change.
    pub fn changes(&self) -> impl Iterator<Item = (&str, PathChange<'_>)> {
        let added = self.added.iter().map(|a| (a.full_path(), PathChange::Added(a)));
        let modified = self
            .modified
            .iter()
            .map(|m| (m.full_path.as_str(), PathChange::Modified(m)));
        let deleted = self
            .deleted
            .iter()
            .map(|d| (d.full_path(), PathChange::Deleted(d)));
        added.chain(modified).chain(deleted)
    }
}

/// A borrowed view of one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathChange<'a> {
    Added(&'a Artifact),
    Modified(&'a Modification),
    Deleted(&'a Artifact),
}

impl<'a> PathChange<'a> {
    /// State of the path after the change; `None` when deleted.
    pub fn resulting(&self) -> Option<&'a Artifact> {
        match *self {
            PathChange::Added(a) => Some(a),
            PathChange::Modified(m) => Some(&m.target),
            PathChange::Deleted(_) => None,
        }
    }
}

/// Stateless change analyzer.
pub struct ChangeAnalyzer;

impl ChangeAnalyzer {
    /// Compare `target` against `baseline`, keyed by `full_path`.
    pub fn analyze(baseline: &[Artifact], target: &[Artifact]) -> ChangeSet {
        let baseline_by_path: HashMap<&str, &Artifact> =
            baseline.iter().map(|a| (a.full_path(), a)).collect();
        let target_by_path: HashMap<&str, &Artifact> =
            target.iter().map(|a| (a.full_path(), a)).collect();

        let mut changes = ChangeSet::default();

        for artifact in target {
            match baseline_by_path.get(artifact.full_path()) {
                None => changes.added.push(artifact.clone()),
                Some(base) if base.content_eq(artifact) => {
                    changes.unchanged.push(artifact.clone())
                }
                Some(base) => changes.modified.push(Modification {
                    full_path: artifact.full_path().to_string(),
                    baseline: (*base).clone(),
                    target: artifact.clone(),
                }),
            }
        }

        for artifact in baseline {
            if !target_by_path.contains_key(artifact.full_path()) {
                changes.deleted.push(artifact.clone());
            }
        }

        changes
            .added
            .sort_by(|a, b| a.full_path().cmp(b.full_path()));
        changes
            .modified
            .sort_by(|a, b| a.full_path.cmp(&b.full_path));
        changes
            .deleted
            .sort_by(|a, b| a.full_path().cmp(b.full_path()));
        changes
            .unchanged
            .sort_by(|a, b| a.full_path().cmp(b.full_path()));

        debug!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            unchanged = changes.unchanged.len(),
            "analyzed changes"
        );
        changes
    }
}
