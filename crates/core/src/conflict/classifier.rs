//! Conflict classification.
//!
//! Given the local and remote [`ChangeSet`]s (both computed against the same
//! baseline), the classifier finds paths that both sides changed into
//! different states. Anything touched by only one side is never a conflict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::analyzer::{ChangeSet, PathChange};
use crate::models::Artifact;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified the same path differently.
    ModifyModify,
    /// Both sides added the same path with different content.
    AddAdd,
    /// Local modified a path that remote deleted.
    ModifyDelete,
    /// Local deleted a path that remote modified.
    DeleteModify,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModifyModify => write!(f, "modify_modify"),
            Self::AddAdd => write!(f, "add_add"),
            Self::ModifyDelete => write!(f, "modify_delete"),
            Self::DeleteModify => write!(f, "delete_modify"),
        }
    }
}

impl ConflictType {
    /// Parse a stored type string.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "modify_modify" => Some(Self::ModifyModify),
            "add_add" => Some(Self::AddAdd),
            "modify_delete" => Some(Self::ModifyDelete),
            "delete_modify" => Some(Self::DeleteModify),
            _ => None,
        }
    }
}

/// A path where local and remote changes are incompatible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub full_path: String,
    pub conflict_type: ConflictType,
    /// Local state; `None` when local deleted the path.
    pub local: Option<Artifact>,
    /// Remote state; `None` when remote deleted the path.
    pub remote: Option<Artifact>,
    /// Baseline state; `None` for add/add.
    pub baseline: Option<Artifact>,
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Stateless conflict classifier.
pub struct ConflictClassifier;

impl ConflictClassifier {
    /// Compare the two change sets and return every true conflict, sorted by
    /// path. Neither input is modified.
    pub fn classify(local: &ChangeSet, remote: &ChangeSet) -> Vec<Conflict> {
        info!(
            local_changes = local.change_count(),
            remote_changes = remote.change_count(),
            "classifying conflicts"
        );

        let remote_by_path: HashMap<&str, PathChange<'_>> = remote.changes().collect();

        let mut conflicts = Vec::new();
        for (path, local_change) in local.changes() {
            let Some(remote_change) = remote_by_path.get(path) else {
                continue;
            };
            if let Some(conflict_type) = classify_pair(&local_change, remote_change) {
                debug!(path, %conflict_type, "conflict detected");
                conflicts.push(Conflict {
                    full_path: path.to_string(),
                    conflict_type,
                    local: local_change.resulting().cloned(),
                    remote: remote_change.resulting().cloned(),
                    baseline: baseline_of(&local_change).or_else(|| baseline_of(remote_change)),
                });
            }
        }

        conflicts.sort_by(|a, b| a.full_path.cmp(&b.full_path));
        info!(count = conflicts.len(), "conflict classification complete");
        conflicts
    }
}

/// Classify two changes to the same path. `None` means the sides converge.
fn classify_pair(local: &PathChange<'_>, remote: &PathChange<'_>) -> Option<ConflictType> {
    use PathChange::{Added, Deleted, Modified};

    let converged = match (local.resulting(), remote.resulting()) {
        (Some(l), Some(r)) => l.content_eq(r),
        (None, None) => true,
        _ => false,
    };
    if converged {
        return None;
    }

    match (local, remote) {
        (Added(_), Added(_)) => Some(ConflictType::AddAdd),
        (Modified(_), Modified(_)) => Some(ConflictType::ModifyModify),
        (Modified(_), Deleted(_)) => Some(ConflictType::ModifyDelete),
        (Deleted(_), Modified(_)) => Some(ConflictType::DeleteModify),

        // Cross-combinations cannot arise from one shared baseline, but are
        // still classified by what each side ended up with.
        (Added(_), Modified(_)) | (Modified(_), Added(_)) => Some(ConflictType::ModifyModify),
        (Added(_), Deleted(_)) => Some(ConflictType::ModifyDelete),
        (Deleted(_), Added(_)) => Some(ConflictType::DeleteModify),
        (Deleted(_), Deleted(_)) => None,
    }
}

fn baseline_of(change: &PathChange<'_>) -> Option<Artifact> {
    match *change {
        PathChange::Added(_) => None,
        PathChange::Modified(m) => Some(m.baseline.clone()),
        PathChange::Deleted(d) => Some(d.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::analyzer::ChangeAnalyzer;
    use crate::models::Snippet;

    fn snip(path: &str, body: &str) -> Artifact {
        Snippet::new(path, body, "text").into()
    }

    fn classify(base: &[Artifact], local: &[Artifact], remote: &[Artifact]) -> Vec<Conflict> {
        let l = ChangeAnalyzer::analyze(base, local);
        let r = ChangeAnalyzer::analyze(base, remote);
        ConflictClassifier::classify(&l, &r)
    }

    #[test]
    fn test_no_conflicts_disjoint() {
        let base = vec![snip("/a", "x")];
        let local = vec![snip("/a", "x"), snip("/b", "y")];
        let remote = vec![snip("/a", "x"), snip("/c", "z")];
        assert!(classify(&base, &local, &remote).is_empty());
    }

    #[test]
    fn test_modify_modify() {
        let base = vec![snip("/a", "x")];
        let conflicts = classify(&base, &[snip("/a", "y")], &[snip("/a", "z")]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::ModifyModify);
        assert_eq!(conflicts[0].baseline.as_ref().and_then(|a| a.body()), Some("x"));
        assert_eq!(conflicts[0].local.as_ref().and_then(|a| a.body()), Some("y"));
        assert_eq!(conflicts[0].remote.as_ref().and_then(|a| a.body()), Some("z"));
    }

    #[test]
    fn test_converging_edits_are_not_conflicts() {
        let base = vec![snip("/a", "x")];
        assert!(classify(&base, &[snip("/a", "same")], &[snip("/a", "same")]).is_empty());
        assert!(classify(&[], &[snip("/n", "same")], &[snip("/n", "same")]).is_empty());
    }

    #[test]
    fn test_add_add_with_different_content() {
        let conflicts = classify(&[], &[snip("/n", "mine")], &[snip("/n", "theirs")]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::AddAdd);
        assert!(conflicts[0].baseline.is_none());
    }

    #[test]
    fn test_modify_delete_both_directions() {
        let base = vec![snip("/a", "x")];
        let conflicts = classify(&base, &[snip("/a", "edited")], &[]);
        assert_eq!(conflicts[0].conflict_type, ConflictType::ModifyDelete);
        assert!(conflicts[0].remote.is_none());

        let conflicts = classify(&base, &[], &[snip("/a", "edited")]);
        assert_eq!(conflicts[0].conflict_type, ConflictType::DeleteModify);
        assert!(conflicts[0].local.is_none());
    }

    #[test]
    fn test_both_deleted_no_conflict() {
        let base = vec![snip("/a", "x")];
        assert!(classify(&base, &[], &[]).is_empty());
    }

    #[test]
    fn test_one_sided_change_never_conflicts() {
        let base = vec![snip("/a", "x"), snip("/b", "y")];
        let local = vec![snip("/a", "changed"), snip("/b", "y")];
        let remote = vec![snip("/a", "x")];
        assert!(classify(&base, &local, &remote).is_empty());
    }

    #[test]
    fn test_inputs_untouched() {
        let base = vec![snip("/a", "x")];
        let l = ChangeAnalyzer::analyze(&base, &[snip("/a", "y")]);
        let r = ChangeAnalyzer::analyze(&base, &[snip("/a", "z")]);
        let (l_before, r_before) = (l.clone(), r.clone());
        let _ = ConflictClassifier::classify(&l, &r);
        assert_eq!(l, l_before);
        assert_eq!(r, r_before);
    }

    #[test]
    fn test_conflict_type_round_trip_names() {
        for t in [
            ConflictType::ModifyModify,
            ConflictType::AddAdd,
            ConflictType::ModifyDelete,
            ConflictType::DeleteModify,
        ] {
            assert_eq!(ConflictType::from_str_val(&t.to_string()), Some(t));
        }
    }
}
