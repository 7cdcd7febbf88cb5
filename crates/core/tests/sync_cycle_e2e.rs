//! End-to-end tests for the sync cycle.
//!
//! Every test runs real `SyncOrchestrator`s against:
//! - Local git clones sharing a bare "origin" repository
//! - In-memory SQLite databases
//! - In-memory artifact stores
//!
//! No network I/O: remotes are plain filesystem paths.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use snipsync_core::codec::{FileSet, JsonCodec, MarkdownCodec, WorkingTreeCodec};
use snipsync_core::db::{ConflictStatus, Database};
use snipsync_core::decision::{ConflictChoice, DecisionChannel, EmptyLocalChoice, Preset, Unattended};
use snipsync_core::errors::{GitError, StorageError, SyncError};
use snipsync_core::git::{GitClient, GitSettings, MergeOutcome, RepoStatus, VersionControl};
use snipsync_core::models::{Artifact, ArtifactKind, Directory, Snippet};
use snipsync_core::storage::{snapshot, ArtifactStore, MemoryStore};
use snipsync_core::sync_engine::{SyncOptions, SyncOrchestrator, SyncOutcome, SyncStep, SyncSummary};
use snipsync_core::worktree::WorkingTree;

// ===========================================================================
// Helpers
// ===========================================================================

/// A bare origin plus room for any number of clones.
struct Env {
    dir: TempDir,
    origin: String,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let origin_path = dir.path().join("origin.git");
        git2::Repository::init_bare(&origin_path).unwrap();
        let origin = origin_path.to_str().unwrap().to_string();
        Self { dir, origin }
    }

    fn client(&self, name: &str) -> GitClient {
        GitClient::open_or_init(
            self.dir.path().join(name),
            Some(&self.origin),
            GitSettings::default(),
        )
        .unwrap()
    }

    fn machine(&self, name: &str, setup: Setup) -> Machine {
        let vcs = Box::new(self.client(name));
        self.machine_with_vcs(name, vcs, setup)
    }

    fn machine_with_vcs(&self, name: &str, vcs: Box<dyn VersionControl>, setup: Setup) -> Machine {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let db = Arc::new(db);
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            vcs,
            setup.store.clone(),
            setup.codec,
            setup.decisions,
        )
        .with_options(setup.options);
        Machine {
            orchestrator,
            store: setup.store,
            db,
            workdir: self.dir.path().join(name),
        }
    }
}

struct Setup {
    store: Arc<dyn ArtifactStore>,
    decisions: Arc<dyn DecisionChannel>,
    codec: Box<dyn WorkingTreeCodec>,
    options: SyncOptions,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            decisions: Arc::new(Unattended),
            codec: Box::new(MarkdownCodec),
            options: SyncOptions::default(),
        }
    }
}

fn pulling() -> Arc<dyn DecisionChannel> {
    Arc::new(Preset {
        empty_local: Some(EmptyLocalChoice::PullRemote),
        ..Default::default()
    })
}

struct Machine {
    orchestrator: SyncOrchestrator,
    store: Arc<dyn ArtifactStore>,
    db: Arc<Database>,
    workdir: PathBuf,
}

impl Machine {
    async fn sync(&mut self) -> SyncOutcome {
        self.orchestrator.run_cycle().await.unwrap()
    }

    async fn sync_ok(&mut self) -> SyncSummary {
        match self.sync().await {
            SyncOutcome::Success { summary, .. } => summary,
            other => panic!("expected a successful cycle, got {other:?}"),
        }
    }

    fn add(&self, path: &str, body: &str) {
        self.store.save_snippet(&Snippet::new(path, body, "text")).unwrap();
    }

    fn edit(&self, path: &str, body: &str) {
        let mut snippet = self.snippet(path).expect("snippet exists");
        snippet.body = body.to_string();
        self.store.update_snippet(&snippet).unwrap();
    }

    fn snippet(&self, path: &str) -> Option<Snippet> {
        snapshot(self.store.as_ref()).unwrap().into_iter().find_map(|a| match a {
            Artifact::Snippet(s) if s.full_path == path => Some(s),
            _ => None,
        })
    }

    fn bodies(&self) -> Vec<(String, String)> {
        bodies(self.store.as_ref())
    }

    fn head(&self) -> Option<String> {
        let repo = git2::Repository::open(&self.workdir).unwrap();
        let head = repo.head().ok()?;
        head.target().map(|oid| oid.to_string())
    }
}

fn bodies(store: &dyn ArtifactStore) -> Vec<(String, String)> {
    snapshot(store)
        .unwrap()
        .iter()
        .filter_map(|a| a.body().map(|b| (a.full_path().to_string(), b.to_string())))
        .collect()
}

fn pair(path: &str, body: &str) -> (String, String) {
    (path.to_string(), body.to_string())
}

/// Machine A holding `/a`, already pushed, and machine B that pulled it.
async fn synced_pair(env: &Env, a: Setup, b: Setup) -> (Machine, Machine) {
    let mut a = env.machine("a", a);
    a.add("/a", "x\n");
    a.sync_ok().await;
    let mut b = env.machine("b", b);
    b.sync_ok().await;
    assert_eq!(b.bodies(), vec![pair("/a", "x\n")]);
    (a, b)
}

// ===========================================================================
// Basic cycles
// ===========================================================================

#[tokio::test]
async fn test_first_sync_pushes_then_settles() {
    let env = Env::new();
    let mut a = env.machine("a", Setup::default());
    a.add("/hello", "fn main() {}\n");
    a.store.create_directory(&Directory::new("/work")).unwrap();
    a.add("/work/notes", "remember\n");

    let summary = a.sync_ok().await;
    assert!(summary.committed);
    assert!(summary.pushed);
    assert!(!summary.merged);

    for _ in 0..2 {
        match a.sync().await {
            SyncOutcome::Success { message, summary } => {
                assert_eq!(message, "no changes");
                assert!(summary.is_noop());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    let origin = git2::Repository::open_bare(&env.origin).unwrap();
    let pushed = origin.find_reference("refs/heads/main").unwrap().target().unwrap();
    assert_eq!(Some(pushed.to_string()), a.head());

    let status = a.orchestrator.status().unwrap();
    assert!(!status.is_syncing);
    assert!(status.last_error.is_none());
    let audit = a.db.list_audit_log(10).unwrap();
    assert_eq!(audit.len(), 3);
    assert!(audit.iter().all(|e| e.action == "sync_cycle" && e.success));
}

#[tokio::test]
async fn test_disjoint_additions_converge() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;

    a.add("/from-a", "alpha\n");
    b.add("/from-b", "beta\n");
    a.sync_ok().await;

    let summary = b.sync_ok().await;
    assert!(summary.committed);
    assert!(summary.merged);
    assert!(summary.pushed);
    assert_eq!(summary.storage_changes, 1);

    a.sync_ok().await;
    let expected = vec![pair("/a", "x\n"), pair("/from-a", "alpha\n"), pair("/from-b", "beta\n")];
    assert_eq!(a.bodies(), expected);
    assert_eq!(b.bodies(), expected);
    assert_eq!(a.head(), b.head());
}

#[tokio::test]
async fn test_local_edit_reaches_unchanged_remote() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;

    b.edit("/a", "x\ny\n");
    let summary = b.sync_ok().await;
    assert!(summary.committed);
    assert!(summary.pushed);
    assert!(!summary.merged);

    let summary = a.sync_ok().await;
    assert!(summary.merged);
    assert_eq!(summary.storage_changes, 1);
    assert_eq!(a.bodies(), vec![pair("/a", "x\ny\n")]);
}

#[tokio::test]
async fn test_remote_deletion_applies_locally() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;
    a.add("/keep", "k\n");
    a.sync_ok().await;
    b.sync_ok().await;

    a.store.delete_snippet("/a").unwrap();
    a.sync_ok().await;
    b.sync_ok().await;
    assert_eq!(b.bodies(), vec![pair("/keep", "k\n")]);
}

#[tokio::test]
async fn test_marker_lines_in_body_reach_other_machine() {
    let env = Env::new();
    let cheatsheet = "<<<<<<< HEAD\nours\n=======\ntheirs\n>>>>>>> branch\n";
    let mut a = env.machine("a", Setup::default());
    a.add("/git-cheatsheet", cheatsheet);
    a.sync_ok().await;

    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let mut b = env.machine("b", b_setup);
    b.sync_ok().await;
    assert_eq!(b.bodies(), vec![pair("/git-cheatsheet", cheatsheet)]);

    match a.sync().await {
        SyncOutcome::Success { message, .. } => assert_eq!(message, "no changes"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// ===========================================================================
// Conflicts
// ===========================================================================

#[tokio::test]
async fn test_modify_modify_conflict_halts_and_persists() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;

    a.edit("/a", "y\n");
    a.sync_ok().await;
    b.edit("/a", "z\n");

    match b.sync().await {
        SyncOutcome::Failed { step, error } => {
            assert_eq!(step, SyncStep::Merging);
            match error {
                SyncError::Conflicts { paths } => assert_eq!(paths, vec!["/a".to_string()]),
                other => panic!("unexpected error: {other}"),
            }
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Local storage untouched, repository clean, conflict recorded.
    assert_eq!(b.bodies(), vec![pair("/a", "z\n")]);
    let repo = git2::Repository::open(&b.workdir).unwrap();
    assert_eq!(repo.state(), git2::RepositoryState::Clean);
    let pending = b.db.pending_conflicts().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].full_path, "/a");

    // Default grace window keeps the next cycle waiting on the user.
    match b.sync().await {
        SyncOutcome::Pending { reason, paths } => {
            assert_eq!(reason, "merge pending user action");
            assert_eq!(paths, vec!["/a".to_string()]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let status = b.orchestrator.status().unwrap();
    assert_eq!(status.last_error.as_deref(), Some("merge pending user action"));
}

#[tokio::test]
async fn test_conflict_settled_by_decision() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: Arc::new(Preset {
            empty_local: Some(EmptyLocalChoice::PullRemote),
            conflict: Some(ConflictChoice::KeepLocal),
            editing: false,
        }),
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;

    a.edit("/a", "y\n");
    a.sync_ok().await;
    b.edit("/a", "z\n");

    let summary = b.sync_ok().await;
    assert!(summary.merged);
    assert!(summary.pushed);
    assert_eq!(summary.conflicts_resolved, 1);
    assert_eq!(b.bodies(), vec![pair("/a", "z\n")]);

    a.sync_ok().await;
    assert_eq!(a.bodies(), vec![pair("/a", "z\n")]);
    assert!(b.db.pending_conflicts().unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_conflicts_are_abandoned() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: pulling(),
        options: SyncOptions {
            stale_merge_grace: Duration::zero(),
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;
    a.edit("/a", "y\n");
    a.sync_ok().await;
    b.edit("/a", "z\n");
    assert!(matches!(b.sync().await, SyncOutcome::Failed { .. }));

    // Past the grace window: the old record is abandoned and the cycle
    // runs again, hitting the same conflict.
    assert!(matches!(b.sync().await, SyncOutcome::Failed { .. }));
    assert_eq!(b.db.count_conflicts_by_status(ConflictStatus::Abandoned).unwrap(), 1);
    assert_eq!(b.db.pending_conflicts().unwrap().len(), 1);
}

#[tokio::test]
async fn test_conflict_being_edited_stays_pending() {
    let env = Env::new();
    let editing = Arc::new(Preset {
        empty_local: Some(EmptyLocalChoice::PullRemote),
        conflict: None,
        editing: true,
    });
    let b_setup = Setup {
        decisions: editing,
        options: SyncOptions {
            stale_merge_grace: Duration::zero(),
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;
    a.edit("/a", "y\n");
    a.sync_ok().await;
    b.edit("/a", "z\n");
    assert!(matches!(b.sync().await, SyncOutcome::Failed { .. }));

    assert!(matches!(b.sync().await, SyncOutcome::Pending { .. }));
    assert_eq!(b.db.count_conflicts_by_status(ConflictStatus::Abandoned).unwrap(), 0);
}

/// Leaves B halfway through a clean merge of A's `/from-a`, with its own
/// `/from-b` committed but not pushed.
async fn interrupted_merge(env: &Env, b_setup: Setup) -> (Machine, Machine) {
    let (mut a, b) = synced_pair(env, Setup::default(), b_setup).await;
    a.add("/from-a", "alpha\n");
    a.sync_ok().await;

    b.add("/from-b", "beta\n");
    let git = env.client("b");
    let artifacts = snapshot(b.store.as_ref()).unwrap();
    WorkingTree::new(git.workdir()).stage(&MarkdownCodec, &artifacts).unwrap();
    git.add_all().unwrap();
    git.commit("local: add /from-b").unwrap();
    git.fetch().unwrap();
    let outcome = git.merge(&git.remote_ref(), false).unwrap();
    assert!(matches!(outcome, MergeOutcome::Merging { .. }));
    assert!(git.merge_in_progress());
    (a, b)
}

#[tokio::test]
async fn test_recent_unfinished_merge_stays_pending() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let (_a, mut b) = interrupted_merge(&env, b_setup).await;

    match b.sync().await {
        SyncOutcome::Pending { reason, paths } => {
            assert_eq!(reason, "merge pending user action");
            assert!(paths.is_empty());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let repo = git2::Repository::open(&b.workdir).unwrap();
    assert_eq!(repo.state(), git2::RepositoryState::Merge);
    assert_eq!(b.bodies(), vec![pair("/a", "x\n"), pair("/from-b", "beta\n")]);
}

#[tokio::test]
async fn test_stale_unfinished_merge_is_aborted() {
    let env = Env::new();
    let b_setup = Setup {
        decisions: pulling(),
        options: SyncOptions {
            stale_merge_grace: Duration::zero(),
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut a, mut b) = interrupted_merge(&env, b_setup).await;

    let summary = b.sync_ok().await;
    assert!(summary.merged);
    assert!(summary.pushed);
    let repo = git2::Repository::open(&b.workdir).unwrap();
    assert_eq!(repo.state(), git2::RepositoryState::Clean);

    a.sync_ok().await;
    let expected = vec![pair("/a", "x\n"), pair("/from-a", "alpha\n"), pair("/from-b", "beta\n")];
    assert_eq!(a.bodies(), expected);
    assert_eq!(b.bodies(), expected);
}

#[tokio::test]
async fn test_json_layout_settles_file_level_conflict() {
    let env = Env::new();
    let a_setup = Setup {
        codec: Box::new(JsonCodec),
        ..Default::default()
    };
    let b_setup = Setup {
        codec: Box::new(JsonCodec),
        decisions: pulling(),
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, a_setup, b_setup).await;

    // Both sides rewrite the single collection file.
    a.add("/x", "from a\n");
    a.sync_ok().await;
    b.add("/y", "from b\n");
    let summary = b.sync_ok().await;
    assert!(summary.merged);
    assert!(summary.pushed);

    a.sync_ok().await;
    let expected = vec![pair("/a", "x\n"), pair("/x", "from a\n"), pair("/y", "from b\n")];
    assert_eq!(a.bodies(), expected);
    assert_eq!(b.bodies(), expected);
}

// ===========================================================================
// Empty local collection
// ===========================================================================

#[tokio::test]
async fn test_empty_local_waits_for_decision() {
    let env = Env::new();
    let mut a = env.machine("a", Setup::default());
    a.add("/a", "x\n");
    a.sync_ok().await;

    let mut b = env.machine("b", Setup::default());
    match b.sync().await {
        SyncOutcome::Pending { reason, paths } => {
            assert!(reason.contains("holds 1 artifacts"), "{reason}");
            assert!(paths.is_empty());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(b.bodies().is_empty());
    assert!(b.head().is_none());

    let cancelling = Setup {
        decisions: Arc::new(Preset {
            empty_local: Some(EmptyLocalChoice::Cancel),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut c = env.machine("c", cancelling);
    assert!(matches!(c.sync().await, SyncOutcome::Cancelled));
    assert!(c.bodies().is_empty());
}

#[tokio::test]
async fn test_force_overwrite_publishes_empty_collection() {
    let env = Env::new();
    let mut a = env.machine("a", Setup::default());
    a.add("/a", "x\n");
    a.sync_ok().await;

    let overwrite = Setup {
        decisions: Arc::new(Preset {
            empty_local: Some(EmptyLocalChoice::ForceOverwrite),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut b = env.machine("b", overwrite);
    let summary = b.sync_ok().await;
    assert!(summary.pushed);
    assert!(b.bodies().is_empty());

    a.sync_ok().await;
    assert!(a.bodies().is_empty());
}

// ===========================================================================
// Failure handling
// ===========================================================================

/// Store that corrupts the next snippet it saves once armed.
struct FaultyStore {
    inner: MemoryStore,
    armed: AtomicBool,
}

impl ArtifactStore for FaultyStore {
    fn list(&self, kind: ArtifactKind) -> Result<Vec<Artifact>, StorageError> {
        self.inner.list(kind)
    }

    fn save_snippet(&self, snippet: &Snippet) -> Result<(), StorageError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let mut corrupted = snippet.clone();
            corrupted.body = "garbage".into();
            return self.inner.save_snippet(&corrupted);
        }
        self.inner.save_snippet(snippet)
    }

    fn update_snippet(&self, snippet: &Snippet) -> Result<(), StorageError> {
        self.inner.update_snippet(snippet)
    }

    fn delete_snippet(&self, full_path: &str) -> Result<(), StorageError> {
        self.inner.delete_snippet(full_path)
    }

    fn create_directory(&self, directory: &Directory) -> Result<(), StorageError> {
        self.inner.create_directory(directory)
    }

    fn delete_directory(&self, full_path: &str) -> Result<(), StorageError> {
        self.inner.delete_directory(full_path)
    }
}

#[tokio::test]
async fn test_failed_storage_update_rolls_back() {
    let env = Env::new();
    let faulty = Arc::new(FaultyStore {
        inner: MemoryStore::new(),
        armed: AtomicBool::new(false),
    });
    let b_setup = Setup {
        store: faulty.clone(),
        decisions: pulling(),
        ..Default::default()
    };
    let (mut a, mut b) = synced_pair(&env, Setup::default(), b_setup).await;

    a.add("/new", "n\n");
    a.sync_ok().await;

    let before = b.bodies();
    let pre_merge = b.head();
    faulty.armed.store(true, Ordering::SeqCst);
    match b.sync().await {
        SyncOutcome::Failed {
            step,
            error: SyncError::InvariantViolation { rolled_back, .. },
        } => {
            assert_eq!(step, SyncStep::Merging);
            assert!(rolled_back);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(b.bodies(), before);
    assert_eq!(b.head(), pre_merge);

    // Nothing is lost: the next cycle sees the same divergence and applies it.
    let summary = b.sync_ok().await;
    assert!(summary.merged);
    assert_eq!(b.bodies(), vec![pair("/a", "x\n"), pair("/new", "n\n")]);
}

#[tokio::test]
async fn test_overlapping_cycle_is_rejected() {
    let env = Env::new();
    let mut a = env.machine("a", Setup::default());
    a.add("/a", "x\n");
    let _held = a.db.begin_cycle(Duration::minutes(15)).unwrap();

    let result = a.orchestrator.run_cycle().await;
    assert!(matches!(result, Err(SyncError::AlreadyRunning { .. })));
    assert!(a.head().is_none());
}

#[tokio::test]
async fn test_missing_remote_data_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let client = GitClient::open_or_init(
        dir.path().join("solo"),
        Some(dir.path().join("nowhere.git").to_str().unwrap()),
        GitSettings::default(),
    )
    .unwrap();
    let db = Database::in_memory().unwrap();
    db.initialize().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.save_snippet(&Snippet::new("/a", "x\n", "text")).unwrap();
    let mut orchestrator = SyncOrchestrator::new(
        Arc::new(db),
        Box::new(client),
        store,
        Box::new(MarkdownCodec),
        Arc::new(Unattended),
    );

    // Commit succeeds; the push to the missing remote is what fails.
    match orchestrator.run_cycle().await.unwrap() {
        SyncOutcome::Failed { step, .. } => assert_eq!(step, SyncStep::Pushing),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let status = orchestrator.status().unwrap();
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_unrelated_histories_merge_to_union() {
    let env = Env::new();
    let mut a = env.machine("a", Setup::default());
    a.add("/a", "x\n");
    a.sync_ok().await;

    let mut b = env.machine("b", Setup::default());
    b.add("/b", "y\n");
    let summary = b.sync_ok().await;
    assert!(summary.committed);
    assert!(summary.merged);
    assert!(summary.pushed);
    assert_eq!(b.bodies(), vec![pair("/a", "x\n"), pair("/b", "y\n")]);

    a.sync_ok().await;
    assert_eq!(a.bodies(), vec![pair("/a", "x\n"), pair("/b", "y\n")]);
}

// ===========================================================================
// Push race
// ===========================================================================

type Race = Box<dyn FnOnce() + Send>;

/// Runs the next queued race right before each push, then delegates.
struct RacingVcs {
    inner: GitClient,
    races: Mutex<VecDeque<Race>>,
}

impl RacingVcs {
    fn new(inner: GitClient, races: Vec<Race>) -> Self {
        Self {
            inner,
            races: Mutex::new(races.into()),
        }
    }
}

impl VersionControl for RacingVcs {
    fn workdir(&self) -> &Path {
        self.inner.workdir()
    }
    fn status(&self) -> Result<RepoStatus, GitError> {
        self.inner.status()
    }
    fn add_all(&self) -> Result<(), GitError> {
        self.inner.add_all()
    }
    fn commit(&self, message: &str) -> Result<Option<String>, GitError> {
        self.inner.commit(message)
    }
    fn fetch(&self) -> Result<(), GitError> {
        self.inner.fetch()
    }
    fn pull(&self) -> Result<MergeOutcome, GitError> {
        self.inner.pull()
    }
    fn push(&self) -> Result<(), GitError> {
        let race = self.races.lock().unwrap().pop_front();
        if let Some(race) = race {
            race();
        }
        self.inner.push()
    }
    fn head(&self) -> Result<Option<String>, GitError> {
        self.inner.head()
    }
    fn remote_head(&self) -> Result<Option<String>, GitError> {
        self.inner.remote_head()
    }
    fn remote_ref(&self) -> String {
        self.inner.remote_ref()
    }
    fn merge_needed(&self) -> Result<bool, GitError> {
        self.inner.merge_needed()
    }
    fn common_ancestor(&self, a: &str, b: &str) -> Result<Option<String>, GitError> {
        self.inner.common_ancestor(a, b)
    }
    fn merge(&self, rev: &str, allow_unrelated: bool) -> Result<MergeOutcome, GitError> {
        self.inner.merge(rev, allow_unrelated)
    }
    fn commit_merge(&self, message: &str) -> Result<String, GitError> {
        self.inner.commit_merge(message)
    }
    fn conflicted_paths(&self) -> Result<Vec<String>, GitError> {
        self.inner.conflicted_paths()
    }
    fn merge_in_progress(&self) -> bool {
        self.inner.merge_in_progress()
    }
    fn merge_started_at(&self) -> Result<Option<DateTime<Utc>>, GitError> {
        self.inner.merge_started_at()
    }
    fn abort_merge(&self) -> Result<(), GitError> {
        self.inner.abort_merge()
    }
    fn read_files_at(&self, rev: &str) -> Result<FileSet, GitError> {
        self.inner.read_files_at(rev)
    }
    fn reset_hard(&self, rev: &str) -> Result<(), GitError> {
        self.inner.reset_hard(rev)
    }
}

#[tokio::test]
async fn test_rejected_push_is_retried_after_merge() {
    let env = Env::new();
    let mut a = env.machine("a", Setup::default());
    a.add("/a", "x\n");
    a.sync_ok().await;

    // A third clone pushes `/race` between B's fetch and B's push.
    let racer = env.client("racer");
    let race: Race = Box::new(move || {
        racer.pull().unwrap();
        let tree = WorkingTree::new(racer.workdir());
        let mut artifacts = tree.load(&MarkdownCodec).unwrap();
        artifacts.push(Snippet::new("/race", "r\n", "text").into());
        tree.stage(&MarkdownCodec, &artifacts).unwrap();
        racer.add_all().unwrap();
        racer.commit("racer: add /race").unwrap();
        racer.push().unwrap();
    });
    let vcs = RacingVcs::new(env.client("b"), vec![race]);
    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let mut b = env.machine_with_vcs("b", Box::new(vcs), b_setup);

    // Pulling the initial state pushes nothing, so the race stays armed.
    b.sync_ok().await;
    b.add("/b", "y\n");

    let summary = b.sync_ok().await;
    assert!(summary.pushed);
    assert!(summary.push_retried);
    assert!(summary.merged);
    assert_eq!(
        b.bodies(),
        vec![pair("/a", "x\n"), pair("/b", "y\n"), pair("/race", "r\n")]
    );

    a.sync_ok().await;
    assert_eq!(a.bodies(), b.bodies());
}

/// Race that commits a file outside the collection from its own clone.
fn unrelated_commit(racer: GitClient, file: &'static str) -> Race {
    Box::new(move || {
        racer.pull().unwrap();
        std::fs::write(racer.workdir().join(file), "notes\n").unwrap();
        racer.add_all().unwrap();
        racer.commit(&format!("racer: add {file}")).unwrap();
        racer.push().unwrap();
    })
}

#[tokio::test]
async fn test_push_rejection_exhausts_retries() {
    let env = Env::new();
    let mut a = env.machine("a", Setup::default());
    a.add("/a", "x\n");
    a.sync_ok().await;

    // Both the first push and the single retry lose the race.
    let races = vec![
        unrelated_commit(env.client("racer1"), "NOTES-1.txt"),
        unrelated_commit(env.client("racer2"), "NOTES-2.txt"),
    ];
    let vcs = RacingVcs::new(env.client("b"), races);
    let b_setup = Setup {
        decisions: pulling(),
        ..Default::default()
    };
    let mut b = env.machine_with_vcs("b", Box::new(vcs), b_setup);
    b.sync_ok().await;
    b.add("/b", "y\n");
    let before = b.bodies();

    match b.sync().await {
        SyncOutcome::Failed { step, error } => {
            assert_eq!(step, SyncStep::Pushing);
            assert!(
                matches!(error, SyncError::Git(GitError::PushRejected { .. })),
                "unexpected error: {error}"
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(b.bodies(), before);
    let status = b.orchestrator.status().unwrap();
    assert!(status.last_error.is_some());

    // No races left: the next cycle merges the second racer and publishes `/b`.
    let summary = b.sync_ok().await;
    assert!(summary.pushed);
    assert!(!summary.push_retried);
    a.sync_ok().await;
    assert_eq!(a.bodies(), vec![pair("/a", "x\n"), pair("/b", "y\n")]);
}
