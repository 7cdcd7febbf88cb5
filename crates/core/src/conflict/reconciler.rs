//! Three-way reconciliation of baseline, local and remote snapshots.
//!
//! Non-conflicting changes from both sides are replayed onto the baseline,
//! conflicts go through the [`ConflictResolver`], and any directory that a
//! surviving artifact lives under is restored if the replay removed it.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info};

use super::analyzer::{ChangeAnalyzer, ChangeSet, PathChange};
use super::classifier::{Conflict, ConflictClassifier};
use super::resolver::{ConflictResolver, Resolution};
use crate::models::{Artifact, ArtifactKind};

/// A conflict paired with what the resolver (or a user) decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub resolution: Resolution,
}

/// Result of reconciling three snapshots.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// The merged artifact set, sorted by path. Manual conflicts contribute
    /// their placeholder.
    pub merged: Vec<Artifact>,
    /// Conflicts settled automatically or by a decision.
    pub resolved: Vec<ResolvedConflict>,
    /// Conflicts still waiting for a manual decision.
    pub manual: Vec<ResolvedConflict>,
    directories: BTreeMap<String, Artifact>,
}

impl Reconciliation {
    /// True when no conflict is waiting for a decision.
    pub fn is_clean(&self) -> bool {
        self.manual.is_empty()
    }

    pub fn manual_paths(&self) -> Vec<String> {
        self.manual
            .iter()
            .map(|c| c.conflict.full_path.clone())
            .collect()
    }

    /// Record a decision for a pending conflict and update the merged set.
    /// Returns false if `path` has no pending conflict.
    pub fn settle(&mut self, path: &str, resolution: Resolution) -> bool {
        let Some(index) = self.manual.iter().position(|c| c.conflict.full_path == path) else {
            return false;
        };
        let pending = self.manual.remove(index);

        let mut merged: BTreeMap<String, Artifact> = self
            .merged
            .drain(..)
            .map(|a| (a.full_path().to_string(), a))
            .collect();
        merged.remove(path);
        if let Some(artifact) = resolution.artifact() {
            merged.insert(path.to_string(), artifact.clone());
        }
        restore_ancestors(&mut merged, &self.directories);
        self.merged = merged.into_values().collect();

        let entry = ResolvedConflict {
            conflict: pending.conflict,
            resolution,
        };
        if entry.resolution.is_resolved() {
            self.resolved.push(entry);
        } else {
            self.manual.insert(index, entry);
        }
        true
    }
}

/// Drives analysis, classification and resolution for one merge.
pub struct Reconciler {
    resolver: ConflictResolver,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ConflictResolver::default())
    }
}

impl Reconciler {
    pub fn new(resolver: ConflictResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn reconcile(
        &self,
        baseline: &[Artifact],
        local: &[Artifact],
        remote: &[Artifact],
    ) -> Reconciliation {
        let local_changes = ChangeAnalyzer::analyze(baseline, local);
        let remote_changes = ChangeAnalyzer::analyze(baseline, remote);
        let conflicts = ConflictClassifier::classify(&local_changes, &remote_changes);
        let conflicted: HashSet<&str> = conflicts.iter().map(|c| c.full_path.as_str()).collect();

        let mut merged: BTreeMap<String, Artifact> = baseline
            .iter()
            .map(|a| (a.full_path().to_string(), a.clone()))
            .collect();
        replay(&mut merged, &local_changes, &conflicted);
        replay(&mut merged, &remote_changes, &conflicted);

        let mut resolved = Vec::new();
        let mut manual = Vec::new();
        for conflict in conflicts {
            let resolution = self.resolver.resolve(&conflict);
            merged.remove(&conflict.full_path);
            if let Some(artifact) = resolution.artifact() {
                merged.insert(conflict.full_path.clone(), artifact.clone());
            }
            let entry = ResolvedConflict {
                conflict,
                resolution,
            };
            if entry.resolution.is_resolved() {
                resolved.push(entry);
            } else {
                manual.push(entry);
            }
        }

        // Remote first: directory naming converges on the remote copy.
        let mut directories = BTreeMap::new();
        for artifact in baseline.iter().chain(local).chain(remote).rev() {
            if artifact.kind() == ArtifactKind::Directory {
                directories
                    .entry(artifact.full_path().to_string())
                    .or_insert_with(|| artifact.clone());
            }
        }
        restore_ancestors(&mut merged, &directories);

        info!(
            merged = merged.len(),
            auto_resolved = resolved.len(),
            manual = manual.len(),
            "reconciliation complete"
        );

        Reconciliation {
            merged: merged.into_values().collect(),
            resolved,
            manual,
            directories,
        }
    }
}

fn replay(merged: &mut BTreeMap<String, Artifact>, changes: &ChangeSet, skip: &HashSet<&str>) {
    for (path, change) in changes.changes() {
        if skip.contains(path) {
            continue;
        }
        match change {
            PathChange::Added(a) => {
                merged.insert(path.to_string(), a.clone());
            }
            PathChange::Modified(m) => {
                merged.insert(path.to_string(), m.target.clone());
            }
            PathChange::Deleted(_) => {
                merged.remove(path);
            }
        }
    }
}

fn restore_ancestors(merged: &mut BTreeMap<String, Artifact>, directories: &BTreeMap<String, Artifact>) {
    let missing: Vec<String> = merged
        .values()
        .flat_map(Artifact::ancestor_paths)
        .filter(|p| !merged.contains_key(p))
        .collect();

    for path in missing {
        if let Some(dir) = directories.get(&path) {
            debug!(path = %path, "restoring ancestor directory");
            merged.insert(path, dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::classifier::ConflictType;
    use crate::conflict::resolver::ResolutionRule;
    use crate::models::{Directory, Snippet};

    fn snip(path: &str, body: &str) -> Artifact {
        Snippet::new(path, body, "text").into()
    }

    fn bodies(r: &Reconciliation) -> Vec<(String, String)> {
        r.merged
            .iter()
            .map(|a| (a.full_path().to_string(), a.body().unwrap_or("<dir>").to_string()))
            .collect()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(p, b)| (p.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_disjoint_additions_union() {
        let base = vec![snip("/a", "x")];
        let local = vec![snip("/a", "x"), snip("/b", "y")];
        let remote = vec![snip("/a", "x"), snip("/c", "z")];
        let r = Reconciler::default().reconcile(&base, &local, &remote);
        assert!(r.is_clean());
        assert!(r.resolved.is_empty());
        assert_eq!(bodies(&r), pairs(&[("/a", "x"), ("/b", "y"), ("/c", "z")]));
    }

    #[test]
    fn test_pure_local_addition_kept() {
        let base = vec![snip("/a", "line1")];
        let local = vec![snip("/a", "line1\nline2")];
        let remote = vec![snip("/a", "line1")];
        let r = Reconciler::default().reconcile(&base, &local, &remote);
        assert!(r.is_clean());
        assert_eq!(bodies(&r), pairs(&[("/a", "line1\nline2")]));
    }

    #[test]
    fn test_true_conflict_reported() {
        let base = vec![snip("/a", "x")];
        let r = Reconciler::default().reconcile(&base, &[snip("/a", "y")], &[snip("/a", "z")]);
        assert!(!r.is_clean());
        assert_eq!(r.manual_paths(), vec!["/a".to_string()]);
        assert_eq!(r.manual[0].conflict.conflict_type, ConflictType::ModifyModify);
        assert_eq!(r.merged.len(), 1);
    }

    #[test]
    fn test_deletions_from_both_sides_apply() {
        let base = vec![snip("/a", "x"), snip("/b", "y"), snip("/c", "z")];
        let local = vec![snip("/b", "y"), snip("/c", "z")];
        let remote = vec![snip("/a", "x"), snip("/c", "z")];
        let r = Reconciler::default().reconcile(&base, &local, &remote);
        assert_eq!(bodies(&r), pairs(&[("/c", "z")]));
    }

    #[test]
    fn test_auto_resolved_conflict_recorded() {
        let base = vec![snip("/a", "x")];
        let r = Reconciler::default().reconcile(&base, &[snip("/a", "edited")], &[]);
        assert!(r.is_clean());
        assert_eq!(r.resolved.len(), 1);
        assert!(matches!(
            r.resolved[0].resolution,
            Resolution::Resolved {
                rule: ResolutionRule::NonEmptySide,
                ..
            }
        ));
        assert_eq!(bodies(&r), pairs(&[("/a", "edited")]));
    }

    #[test]
    fn test_restores_deleted_parent_directory() {
        let base = vec![Directory::new("/work").into(), snip("/work/a", "x")];
        // Local removed the folder; remote added a snippet inside it.
        let local: Vec<Artifact> = vec![];
        let remote = vec![
            Directory::new("/work").into(),
            snip("/work/a", "x"),
            snip("/work/b", "new"),
        ];
        let r = Reconciler::default().reconcile(&base, &local, &remote);
        let paths: Vec<&str> = r.merged.iter().map(Artifact::full_path).collect();
        assert_eq!(paths, vec!["/work", "/work/b"]);
    }

    #[test]
    fn test_settle_manual_conflict() {
        let base = vec![snip("/a", "x")];
        let mut r = Reconciler::default().reconcile(&base, &[snip("/a", "y")], &[snip("/a", "z")]);
        let conflict = r.manual[0].conflict.clone();
        let choice = ConflictResolver::apply_choice(
            &conflict,
            &crate::decision::ConflictChoice::UseContent("y and z".into()),
        );
        assert!(r.settle("/a", choice));
        assert!(r.is_clean());
        assert_eq!(bodies(&r), pairs(&[("/a", "y and z")]));
        assert!(!r.settle("/a", Resolution::NeedsManual { placeholder: None, reason: String::new() }));
    }
}
