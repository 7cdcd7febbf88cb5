//! The synchronization cycle.
//!
//! [`SyncOrchestrator::run_cycle`] drives one pass of the state machine:
//!
//! 1. Clean up a merge or pending conflicts left by an earlier cycle, unless
//!    they are recent or the user is working on them.
//! 2. Snapshot local storage; an empty collection against a populated
//!    repository needs an explicit decision before anything is written.
//! 3. Stage the snapshot into the working tree and commit if it changed.
//! 4. Fetch.
//! 5. If the remote has commits HEAD lacks, reconcile baseline/local/remote,
//!    merge, commit the reconciled tree and apply it to local storage.
//! 6. Push, retrying once through fetch+merge if the push is rejected.
//!
//! A lock token persisted in the database keeps cycles from overlapping.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::codec::WorkingTreeCodec;
use crate::config::{AppConfig, SyncConfig};
use crate::conflict::{ConflictResolver, Reconciler, Resolution};
use crate::db::{ConflictStatus, Database};
use crate::decision::{DecisionChannel, EmptyLocalChoice};
use crate::errors::{GitError, StorageError, SyncError};
use crate::git::{MergeOutcome, VersionControl};
use crate::models::{Artifact, AuditEntry, SyncStatus};
use crate::storage::{snapshot, ArtifactStore, SafeStorageUpdater};
use crate::worktree::WorkingTree;

/// Prefix of every commit message the cycle writes.
pub const COMMIT_PREFIX: &str = "snipsync:";

// ---------------------------------------------------------------------------
// Sync state machine
// ---------------------------------------------------------------------------

/// Steps of a sync cycle. The current step is persisted as the sync state
/// and reported with failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    CleaningUnfinishedMerge,
    CheckingLocalStatus,
    StagingLocal,
    Fetching,
    CheckingMergeNeeded,
    Merging,
    Pushing,
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CleaningUnfinishedMerge => write!(f, "cleaning_unfinished_merge"),
            Self::CheckingLocalStatus => write!(f, "checking_local_status"),
            Self::StagingLocal => write!(f, "staging_local"),
            Self::Fetching => write!(f, "fetching"),
            Self::CheckingMergeNeeded => write!(f, "checking_merge_needed"),
            Self::Merging => write!(f, "merging"),
            Self::Pushing => write!(f, "pushing"),
        }
    }
}

/// What happened during a successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub committed: bool,
    pub merged: bool,
    pub pushed: bool,
    pub push_retried: bool,
    pub storage_changes: usize,
    pub conflicts_resolved: usize,
}

impl SyncSummary {
    pub fn is_noop(&self) -> bool {
        !self.committed && !self.merged && !self.pushed && self.storage_changes == 0
    }

    pub fn message(&self) -> String {
        if self.is_noop() {
            return "no changes".into();
        }
        let mut parts = Vec::new();
        if self.committed {
            parts.push("committed local changes".to_string());
        }
        if self.merged {
            if self.conflicts_resolved > 0 {
                parts.push(format!(
                    "merged remote changes ({} conflicts resolved)",
                    self.conflicts_resolved
                ));
            } else {
                parts.push("merged remote changes".to_string());
            }
        }
        if self.storage_changes > 0 {
            parts.push(format!("applied {} local updates", self.storage_changes));
        }
        if self.pushed {
            parts.push(if self.push_retried {
                "pushed after retry".to_string()
            } else {
                "pushed".to_string()
            });
        }
        parts.join(", ")
    }
}

/// Result of one cycle.
#[derive(Debug)]
pub enum SyncOutcome {
    Success { message: String, summary: SyncSummary },
    /// The cycle stopped at `step`. The repository is left clean.
    Failed { step: SyncStep, error: SyncError },
    /// Waiting on the user: a merge they are working on, or the
    /// empty-local decision.
    Pending { reason: String, paths: Vec<String> },
    /// The user declined to continue.
    Cancelled,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Paths the outcome concerns (conflicts, pending merge files).
    pub fn paths(&self) -> &[String] {
        match self {
            Self::Failed { error, .. } => error.affected_paths(),
            Self::Pending { paths, .. } => paths.as_slice(),
            _ => &[],
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Success { message, .. } => message.clone(),
            Self::Failed { step, error } => format!("sync failed while {step}: {error}"),
            Self::Pending { reason, .. } => reason.clone(),
            Self::Cancelled => "sync cancelled".into(),
        }
    }
}

/// Tunables for the cycle, usually taken from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub stale_merge_grace: chrono::Duration,
    pub lock_timeout: chrono::Duration,
    pub push_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            stale_merge_grace: config.stale_merge_grace(),
            lock_timeout: config.lock_timeout(),
            push_retries: config.push_retries,
        }
    }
}

/// Which side wins wholesale, when the user chose so for an empty local
/// collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    Reconcile,
    PullRemote,
    ForceOverwrite,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives sync cycles between local storage and a repository.
pub struct SyncOrchestrator {
    db: Arc<Database>,
    vcs: Box<dyn VersionControl>,
    store: Arc<dyn ArtifactStore>,
    codec: Box<dyn WorkingTreeCodec>,
    decisions: Arc<dyn DecisionChannel>,
    reconciler: Reconciler,
    options: SyncOptions,
    step: SyncStep,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<Database>,
        vcs: Box<dyn VersionControl>,
        store: Arc<dyn ArtifactStore>,
        codec: Box<dyn WorkingTreeCodec>,
        decisions: Arc<dyn DecisionChannel>,
    ) -> Self {
        info!(codec = codec.name(), workdir = %vcs.workdir().display(), "initializing sync orchestrator");
        Self {
            db,
            vcs,
            store,
            codec,
            decisions,
            reconciler: Reconciler::default(),
            options: SyncOptions::default(),
            step: SyncStep::CleaningUnfinishedMerge,
        }
    }

    /// Wire an orchestrator from a loaded configuration.
    pub fn from_config(
        config: &AppConfig,
        db: Arc<Database>,
        vcs: Box<dyn VersionControl>,
        store: Arc<dyn ArtifactStore>,
        decisions: Arc<dyn DecisionChannel>,
    ) -> Self {
        Self::new(db, vcs, store, crate::codec::codec_for(config.repository.format), decisions)
            .with_reconciler(config.sync.reconciler())
            .with_options(SyncOptions::from_config(&config.sync))
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(self.db.sync_status()?)
    }

    fn worktree(&self) -> WorkingTree {
        WorkingTree::new(self.vcs.workdir())
    }

    fn enter(&mut self, step: SyncStep) -> Result<(), SyncError> {
        self.step = step;
        self.db.set_sync_state(&step.to_string())?;
        debug!(step = %step, "entering sync step");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one full sync cycle.
    ///
    /// Returns `Err` only when the cycle could not start (another one holds
    /// the lock) or its bookkeeping could not be written. Everything that
    /// happens inside the cycle is reported through [`SyncOutcome`].
    pub async fn run_cycle(&mut self) -> Result<SyncOutcome, SyncError> {
        let token = self.db.begin_cycle(self.options.lock_timeout)?;
        self.step = SyncStep::CleaningUnfinishedMerge;
        info!("sync cycle started");

        let outcome = match self.cycle().await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(step = %self.step, error = %error, "sync cycle failed");
                SyncOutcome::Failed {
                    step: self.step,
                    error,
                }
            }
        };

        let message = outcome.message();
        let (last_error, connected) = match &outcome {
            SyncOutcome::Success { .. } => (None, true),
            SyncOutcome::Failed { error, .. } => (Some(message.clone()), !matches!(error, SyncError::Remote(_))),
            SyncOutcome::Pending { .. } | SyncOutcome::Cancelled => (Some(message.clone()), true),
        };

        let audit = if outcome.is_success() {
            AuditEntry::success("sync_cycle", &message)
        } else {
            AuditEntry::failure("sync_cycle", &message)
        };
        if let Err(e) = self.db.insert_audit_entry(&audit) {
            warn!(error = %e, "failed to write audit entry");
        }

        self.db.end_cycle(&token, last_error.as_deref(), connected)?;
        info!(outcome = %message, "sync cycle finished");
        Ok(outcome)
    }

    async fn cycle(&mut self) -> Result<SyncOutcome, SyncError> {
        self.enter(SyncStep::CleaningUnfinishedMerge)?;
        if let Some(pending) = self.clean_unfinished_merge().await? {
            return Ok(pending);
        }

        self.enter(SyncStep::CheckingLocalStatus)?;
        let local = snapshot(self.store.as_ref())?;
        let mut mode = CycleMode::Reconcile;
        if local.is_empty() {
            let remote_count = self.known_repository_count()?;
            if remote_count > 0 {
                warn!(remote_count, "local collection is empty but the repository is not");
                match self.decisions.on_empty_local(remote_count).await {
                    None => {
                        return Ok(SyncOutcome::Pending {
                            reason: format!(
                                "local collection is empty but the repository holds {remote_count} artifacts; \
                                 choose pull-remote, force-overwrite or cancel"
                            ),
                            paths: Vec::new(),
                        });
                    }
                    Some(EmptyLocalChoice::Cancel) => return Ok(SyncOutcome::Cancelled),
                    Some(EmptyLocalChoice::PullRemote) => mode = CycleMode::PullRemote,
                    Some(EmptyLocalChoice::ForceOverwrite) => mode = CycleMode::ForceOverwrite,
                }
                info!(choice = ?mode, "empty local collection decision");
            }
        }

        let mut summary = SyncSummary::default();

        if mode != CycleMode::PullRemote {
            self.enter(SyncStep::StagingLocal)?;
            let written = self.worktree().stage(self.codec.as_ref(), &local)?;
            self.vcs.add_all()?;
            let message = format!("{COMMIT_PREFIX} local changes ({} artifacts)", local.len());
            if let Some(sha) = self.vcs.commit(&message)? {
                info!(sha = %sha, files = written, "committed local changes");
                summary.committed = true;
            }
        }

        self.enter(SyncStep::Fetching)?;
        self.fetch()?;

        self.merge_remote(mode, &mut summary).await?;

        self.enter(SyncStep::Pushing)?;
        let mut retries = 0;
        loop {
            match self.push_if_ahead() {
                Ok(pushed) => {
                    summary.pushed = pushed;
                    break;
                }
                Err(GitError::PushRejected { detail, .. }) if retries < self.options.push_retries => {
                    retries += 1;
                    warn!(detail = %detail, attempt = retries, "push rejected, fetching and merging before retrying");
                    summary.push_retried = true;
                    self.enter(SyncStep::Fetching)?;
                    self.vcs.fetch()?;
                    self.merge_remote(mode, &mut summary).await?;
                    self.enter(SyncStep::Pushing)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let cleared = self.db.mark_conflicts(ConflictStatus::Resolved)?;
        if cleared > 0 {
            info!(count = cleared, "pending conflicts resolved");
        }

        Ok(SyncOutcome::Success {
            message: summary.message(),
            summary,
        })
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Entry guard. Returns `Some(Pending)` when leftover merge state must be
    /// left for the user; otherwise clears it.
    async fn clean_unfinished_merge(&mut self) -> Result<Option<SyncOutcome>, SyncError> {
        let in_progress = self.vcs.merge_in_progress();
        let pending = self.db.pending_conflicts()?;
        if !in_progress && pending.is_empty() {
            return Ok(None);
        }

        let mut paths: Vec<String> = pending.iter().map(|c| c.full_path.clone()).collect();
        if in_progress {
            paths.extend(self.vcs.conflicted_paths()?);
        }
        paths.sort();
        paths.dedup();

        let started = [self.vcs.merge_started_at()?, self.db.oldest_pending_conflict_at()?]
            .into_iter()
            .flatten()
            .min();
        let recent = started.is_some_and(|at| Utc::now() - at < self.options.stale_merge_grace);
        if recent || self.decisions.is_editing(&paths).await {
            info!(paths = ?paths, recent, "unfinished merge is waiting for the user");
            return Ok(Some(SyncOutcome::Pending {
                reason: "merge pending user action".into(),
                paths,
            }));
        }

        if in_progress {
            warn!("aborting stale merge left by an earlier cycle");
            self.vcs.abort_merge()?;
        }
        if !pending.is_empty() {
            let abandoned = self.db.mark_conflicts(ConflictStatus::Abandoned)?;
            warn!(count = abandoned, "abandoned stale pending conflicts");
        }
        Ok(None)
    }

    /// Largest artifact count among HEAD and the remote-tracking ref, after
    /// a best-effort fetch.
    fn known_repository_count(&self) -> Result<usize, SyncError> {
        if let Err(e) = self.vcs.fetch() {
            if e.is_auth() {
                return Err(e.into());
            }
            warn!(error = %e, "fetch failed, using last known remote state");
        }
        let mut count = 0;
        for rev in [self.vcs.head()?, self.vcs.remote_head()?].into_iter().flatten() {
            count = count.max(self.artifacts_at(&rev)?.len());
        }
        Ok(count)
    }

    fn fetch(&self) -> Result<(), SyncError> {
        match self.vcs.fetch() {
            Ok(()) => Ok(()),
            Err(e) if e.is_auth() => Err(e.into()),
            Err(e) => {
                if self.vcs.remote_head()?.is_some() {
                    return Err(e.into());
                }
                warn!(error = %e, "fetch failed and the remote has no data yet, continuing");
                Ok(())
            }
        }
    }

    fn artifacts_at(&self, rev: &str) -> Result<Vec<Artifact>, SyncError> {
        let files = self.vcs.read_files_at(rev)?;
        Ok(self.codec.decode(&files)?)
    }

    async fn merge_remote(&mut self, mode: CycleMode, summary: &mut SyncSummary) -> Result<(), SyncError> {
        self.enter(SyncStep::CheckingMergeNeeded)?;
        let remote_head = self.vcs.remote_head()?;
        let needed = match remote_head {
            Some(_) => self.vcs.merge_needed()?,
            None => false,
        };
        let remote_head = match remote_head {
            Some(sha) if needed => sha,
            _ => {
                debug!("no remote changes to merge");
                if mode == CycleMode::PullRemote {
                    let head = self.vcs.head()?;
                    let target = match head {
                        Some(ref sha) => self.artifacts_at(sha)?,
                        None => Vec::new(),
                    };
                    self.apply_to_storage(&target, head.as_deref(), summary)?;
                }
                return Ok(());
            }
        };

        self.enter(SyncStep::Merging)?;
        let head = self.vcs.head()?;
        let base = match head {
            Some(ref sha) => self.vcs.common_ancestor(sha, &remote_head)?,
            None => None,
        };
        if head.is_some() && base.is_none() {
            warn!("local and remote histories are unrelated, merging against an empty baseline");
        }

        let baseline = match base {
            Some(ref sha) => self.artifacts_at(sha)?,
            None => Vec::new(),
        };
        let local = match head {
            Some(ref sha) => self.artifacts_at(sha)?,
            None => Vec::new(),
        };
        let remote = self.artifacts_at(&remote_head)?;

        let merged = match mode {
            CycleMode::Reconcile => {
                let (merged, settled) = self.reconcile(&baseline, &local, &remote).await?;
                summary.conflicts_resolved += settled;
                merged
            }
            CycleMode::PullRemote => remote,
            CycleMode::ForceOverwrite => local,
        };

        let outcome = self.git_merge()?;
        if let Err(e) = self.commit_merged(&merged, &outcome) {
            self.rollback_repository(head.as_deref());
            return Err(e);
        }
        summary.merged = true;

        self.apply_to_storage(&merged, head.as_deref(), summary)
    }

    /// Reconcile the three snapshots, asking the decision channel about
    /// anything the resolver could not settle. Returns the merged set and
    /// the number of conflicts settled.
    async fn reconcile(
        &self,
        baseline: &[Artifact],
        local: &[Artifact],
        remote: &[Artifact],
    ) -> Result<(Vec<Artifact>, usize), SyncError> {
        let mut reconciliation = self.reconciler.reconcile(baseline, local, remote);

        for pending in reconciliation.manual.clone() {
            let placeholder = match &pending.resolution {
                Resolution::NeedsManual { placeholder, .. } => placeholder.as_ref(),
                Resolution::Resolved { .. } => None,
            };
            if let Some(choice) = self.decisions.on_conflict(&pending.conflict, placeholder).await {
                debug!(path = %pending.conflict.full_path, choice = ?choice, "conflict decision");
                let resolution = ConflictResolver::apply_choice(&pending.conflict, &choice);
                reconciliation.settle(&pending.conflict.full_path, resolution);
            }
        }

        if !reconciliation.is_clean() {
            for entry in &reconciliation.manual {
                let reason = match &entry.resolution {
                    Resolution::NeedsManual { reason, .. } => reason.as_str(),
                    Resolution::Resolved { .. } => "",
                };
                self.db.insert_pending_conflict(&entry.conflict, reason)?;
            }
            let paths = reconciliation.manual_paths();
            warn!(paths = ?paths, "conflicts need manual resolution");
            return Err(SyncError::Conflicts { paths });
        }

        let settled = reconciliation.resolved.len();
        Ok((reconciliation.merged, settled))
    }

    /// Run the repository merge, retrying once with unrelated histories
    /// allowed.
    fn git_merge(&self) -> Result<MergeOutcome, SyncError> {
        let remote_ref = self.vcs.remote_ref();
        match self.vcs.merge(&remote_ref, false) {
            Err(GitError::UnrelatedHistories { ours, theirs }) => {
                warn!(ours = %ours, theirs = %theirs, "unrelated histories, retrying merge with them allowed");
                Ok(self.vcs.merge(&remote_ref, true)?)
            }
            other => Ok(other?),
        }
    }

    /// Write the merged set over whatever the merge left in the working
    /// tree and conclude the merge.
    fn commit_merged(&self, merged: &[Artifact], outcome: &MergeOutcome) -> Result<(), SyncError> {
        let tree = self.worktree();
        tree.stage(self.codec.as_ref(), merged)?;
        self.vcs.add_all()?;

        let conflicted = self.vcs.conflicted_paths()?;
        if !conflicted.is_empty() {
            return Err(GitError::UnresolvedConflicts(conflicted).into());
        }
        let marked = tree.conflict_marked_paths(self.codec.as_ref())?;
        if !marked.is_empty() {
            return Err(GitError::UnresolvedConflicts(marked).into());
        }

        match outcome {
            MergeOutcome::Merging { conflicted_paths } => {
                let message = if conflicted_paths.is_empty() {
                    format!("{COMMIT_PREFIX} merge remote changes")
                } else {
                    format!(
                        "{COMMIT_PREFIX} merge remote changes\n\nReconciled: {}",
                        conflicted_paths.join(", ")
                    )
                };
                let sha = self.vcs.commit_merge(&message)?;
                info!(sha = %sha, "committed merge");
            }
            MergeOutcome::FastForward | MergeOutcome::UpToDate => {
                if let Some(sha) = self.vcs.commit(&format!("{COMMIT_PREFIX} reconcile merged state"))? {
                    info!(sha = %sha, "committed reconciled state");
                }
            }
        }
        Ok(())
    }

    /// Bring local storage to `merged`. On failure the repository goes back
    /// to `pre_merge` so the next cycle sees the same divergence.
    fn apply_to_storage(
        &self,
        merged: &[Artifact],
        pre_merge: Option<&str>,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        match SafeStorageUpdater::apply(self.store.as_ref(), merged) {
            Ok(report) => {
                summary.storage_changes += report.total();
                Ok(())
            }
            Err(StorageError::ValidationFailed { detail, restored }) => {
                self.rollback_repository(pre_merge);
                Err(SyncError::InvariantViolation {
                    detail,
                    rolled_back: restored,
                })
            }
            Err(e) => {
                self.rollback_repository(pre_merge);
                Err(e.into())
            }
        }
    }

    fn rollback_repository(&self, pre_merge: Option<&str>) {
        let result = match pre_merge {
            Some(sha) => self.vcs.reset_hard(sha),
            None if self.vcs.merge_in_progress() => self.vcs.abort_merge(),
            None => Ok(()),
        };
        if let Err(e) = result {
            error!(error = %e, "failed to roll the repository back");
        }
    }

    /// Push when HEAD is not what the remote already has. Returns whether a
    /// push happened.
    fn push_if_ahead(&self) -> Result<bool, GitError> {
        let Some(head) = self.vcs.head()? else {
            debug!("nothing committed yet, skipping push");
            return Ok(false);
        };
        if self.vcs.remote_head()?.as_deref() == Some(head.as_str()) {
            debug!("remote already has HEAD");
            return Ok(false);
        }
        self.vcs.push()?;
        Ok(true)
    }
}
