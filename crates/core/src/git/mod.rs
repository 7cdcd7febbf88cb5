//! Version-control collaborator for the sync cycle.
//!
//! [`VersionControl`] is the porcelain the orchestrator drives; [`GitClient`]
//! implements it on top of `git2`. All calls block: the orchestrator runs
//! them one after another because the working tree is a single mutable
//! resource.

pub mod client;

pub use client::{GitClient, GitSettings};

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::FileSet;
use crate::errors::GitError;

/// Working tree and index state, split into the lists the sync cycle reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    /// Paths with changes recorded in the index.
    pub staged: Vec<String>,
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
    pub conflicted: Vec<String>,
}

impl RepoStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.created.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
            && self.conflicted.is_empty()
    }
}

/// What a merge did to HEAD and the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// HEAD already contains the other side.
    UpToDate,
    /// HEAD moved to the other side; no merge commit is needed.
    FastForward,
    /// A merge is in progress: MERGE_HEAD is written and the index and
    /// working tree hold the merged files. `conflicted_paths` still carry
    /// conflict entries (and markers in the files).
    Merging { conflicted_paths: Vec<String> },
}

/// Porcelain-level repository operations used by the sync cycle.
pub trait VersionControl: Send {
    /// Root of the working tree.
    fn workdir(&self) -> &Path;

    fn status(&self) -> Result<RepoStatus, GitError>;

    /// Stage every change in the working tree, including deletions, and
    /// settle index conflict entries to whatever the working tree now holds.
    fn add_all(&self) -> Result<(), GitError>;

    /// Commit the index. Returns `None` when the index matches HEAD.
    fn commit(&self, message: &str) -> Result<Option<String>, GitError>;

    fn fetch(&self) -> Result<(), GitError>;

    /// Fetch, then merge the remote branch.
    fn pull(&self) -> Result<MergeOutcome, GitError>;

    fn push(&self) -> Result<(), GitError>;

    /// SHA of HEAD, `None` on an unborn branch.
    fn head(&self) -> Result<Option<String>, GitError>;

    /// SHA of the remote-tracking ref, `None` if the remote has no data yet.
    fn remote_head(&self) -> Result<Option<String>, GitError>;

    /// The remote-tracking ref name (e.g. `refs/remotes/origin/main`).
    fn remote_ref(&self) -> String;

    /// True if the remote-tracking ref has commits HEAD does not contain.
    fn merge_needed(&self) -> Result<bool, GitError>;

    /// Best common ancestor of two commits; `None` for unrelated histories.
    fn common_ancestor(&self, a: &str, b: &str) -> Result<Option<String>, GitError>;

    /// Merge `rev` into HEAD without committing. Unrelated histories are
    /// refused with [`GitError::UnrelatedHistories`] unless `allow_unrelated`.
    fn merge(&self, rev: &str, allow_unrelated: bool) -> Result<MergeOutcome, GitError>;

    /// Conclude an in-progress merge with a commit.
    fn commit_merge(&self, message: &str) -> Result<String, GitError>;

    fn conflicted_paths(&self) -> Result<Vec<String>, GitError>;

    fn merge_in_progress(&self) -> bool;

    /// When the in-progress merge started, if one is in progress.
    fn merge_started_at(&self) -> Result<Option<DateTime<Utc>>, GitError>;

    /// Drop an in-progress merge and restore HEAD's tree.
    fn abort_merge(&self) -> Result<(), GitError>;

    /// All text files in the tree of `rev`, keyed by relative path.
    fn read_files_at(&self, rev: &str) -> Result<FileSet, GitError>;

    /// Move HEAD to `rev` and make index and working tree match it.
    fn reset_hard(&self, rev: &str) -> Result<(), GitError>;
}
