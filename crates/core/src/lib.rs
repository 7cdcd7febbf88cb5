//! SnipSync core library.
//!
//! Synchronizes a local collection of snippets and directories with a git
//! repository: change analysis against a common baseline, conflict
//! classification and resolution, the commit/fetch/merge/push cycle, and a
//! storage updater that rolls back when the result does not check out.

pub mod codec;
pub mod config;
pub mod conflict;
pub mod db;
pub mod decision;
pub mod errors;
pub mod git;
pub mod models;
pub mod storage;
pub mod sync_engine;
pub mod worktree;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use decision::{DecisionChannel, Unattended};
pub use git::{GitClient, VersionControl};
pub use models::{Artifact, Directory, Snippet};
pub use storage::{ArtifactStore, MemoryStore, SafeStorageUpdater};
pub use sync_engine::{SyncOrchestrator, SyncOutcome};
