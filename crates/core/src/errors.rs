//! Error types for the SnipSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from version-control operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error that does not fall into a more specific class.
    #[error("git2 error: {0}")]
    Git2Error(#[source] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The named remote is not configured on the repository.
    #[error("git remote '{0}' is not configured")]
    RemoteNotConfigured(String),

    /// The remote rejected our credentials.
    #[error("git authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Transport-level failure talking to the remote.
    #[error("git network error: {0}")]
    Network(String),

    /// The two refs share no common ancestor.
    #[error("refusing to merge unrelated histories ({ours} and {theirs})")]
    UnrelatedHistories { ours: String, theirs: String },

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// An operation requiring a clean repository found a merge in progress.
    #[error("a merge is already in progress")]
    MergeInProgress,

    /// `commit_merge` was called without a merge in progress.
    #[error("no merge in progress")]
    NoMergeInProgress,

    /// The index still has conflict entries.
    #[error("unresolved conflicts remain in the index: {}", .0.join(", "))]
    UnresolvedConflicts(Vec<String>),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<git2::Error> for GitError {
    fn from(err: git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode};

        match (err.class(), err.code()) {
            (_, ErrorCode::Auth) | (ErrorClass::Ssh, _) => {
                GitError::AuthenticationFailed(err.message().to_string())
            }
            (ErrorClass::Http, _) if err.message().contains("401") => {
                GitError::AuthenticationFailed(err.message().to_string())
            }
            (ErrorClass::Net, _) | (ErrorClass::Http, _) | (ErrorClass::Ssl, _) => {
                GitError::Network(err.message().to_string())
            }
            (_, ErrorCode::Certificate) | (_, ErrorCode::Timeout) => {
                GitError::Network(err.message().to_string())
            }
            _ => GitError::Git2Error(err),
        }
    }
}

impl GitError {
    /// Network failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, GitError::Network(_))
    }

    /// Credential problems; these must be surfaced to the user as-is.
    pub fn is_auth(&self) -> bool {
        matches!(self, GitError::AuthenticationFailed(_))
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from the local artifact store and the safe updater.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Update or delete of a path the store does not hold.
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// Create of a path the store already holds.
    #[error("artifact already exists: {0}")]
    AlreadyExists(String),

    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Post-apply validation failed; `restored` reports whether the
    /// pre-update snapshot was put back.
    #[error("storage validation failed ({detail}); backup restored: {restored}")]
    ValidationFailed { detail: String, restored: bool },

    /// Database error from the SQLite store.
    #[error("storage database error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Errors from working-tree (de)serialization.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON document could not be read or written.
    #[error("snippet document error: {0}")]
    Json(#[from] serde_json::Error),

    /// A metadata block could not be parsed.
    #[error("invalid metadata in '{path}': {detail}")]
    Metadata { path: String, detail: String },

    /// A file does not have the expected layout.
    #[error("malformed file '{path}': {detail}")]
    Malformed { path: String, detail: String },

    /// An artifact path cannot be mapped to a working-tree file.
    #[error("invalid artifact path '{0}'")]
    InvalidPath(String),

    /// A working-tree file still carries merge conflict markers.
    #[error("unresolved conflict markers in '{0}'")]
    ConflictMarkers(String),

    /// Reading or writing the working tree failed.
    #[error("working tree I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the synchronization cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync cycle is already running.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The lock token presented at the end of a cycle is not the live one.
    #[error("sync lock token mismatch; the lock was taken over by another cycle")]
    LockLost,

    /// Conflicts the resolution policy could not settle.
    #[error("unresolved conflicts: {}", .paths.join(", "))]
    Conflicts { paths: Vec<String> },

    /// Local storage did not match the merged state after an update.
    #[error("storage invariant violated: {detail} (rolled back: {rolled_back})")]
    InvariantViolation { detail: String, rolled_back: bool },

    /// Network or authentication failure talking to the remote.
    #[error("remote operation failed: {0}")]
    Remote(#[source] GitError),

    /// Any other version-control failure.
    #[error("sync git error: {0}")]
    Git(#[source] GitError),

    /// Local store failure.
    #[error("sync storage error: {0}")]
    Storage(#[from] StorageError),

    /// Working-tree codec failure.
    #[error("sync codec error: {0}")]
    Codec(#[from] CodecError),

    /// Database error during sync.
    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<GitError> for SyncError {
    fn from(err: GitError) -> Self {
        if err.is_transient() || err.is_auth() {
            SyncError::Remote(err)
        } else {
            SyncError::Git(err)
        }
    }
}

impl SyncError {
    /// Paths the failure concerns, for callers that present them.
    pub fn affected_paths(&self) -> &[String] {
        match self {
            SyncError::Conflicts { paths } => paths.as_slice(),
            SyncError::Git(GitError::UnresolvedConflicts(paths)) => paths.as_slice(),
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored value could not be decoded.
    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: String, detail: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = StorageError::NotFound("/work/hello".into());
        assert_eq!(err.to_string(), "artifact not found: /work/hello");

        let err = SyncError::Conflicts {
            paths: vec!["/a".into(), "/b".into()],
        };
        assert_eq!(err.to_string(), "unresolved conflicts: /a, /b");

        let err = ConfigError::InvalidValue {
            field: "repository.branch".into(),
            detail: "must not be empty".into(),
        };
        assert!(err.to_string().contains("repository.branch"));
    }

    #[test]
    fn test_git_error_classification() {
        let auth = git2::Error::new(
            git2::ErrorCode::Auth,
            git2::ErrorClass::Http,
            "authentication required",
        );
        assert!(GitError::from(auth).is_auth());

        let net = git2::Error::new(
            git2::ErrorCode::GenericError,
            git2::ErrorClass::Net,
            "failed to resolve address",
        );
        assert!(GitError::from(net).is_transient());

        let other = git2::Error::from_str("object not found");
        assert!(matches!(GitError::from(other), GitError::Git2Error(_)));
    }

    #[test]
    fn test_sync_error_routes_remote_failures() {
        let err: SyncError = GitError::Network("timed out".into()).into();
        assert!(matches!(err, SyncError::Remote(_)));

        let err: SyncError = GitError::RefNotFound("HEAD".into()).into();
        assert!(matches!(err, SyncError::Git(_)));
    }

    #[test]
    fn test_affected_paths() {
        let err = SyncError::Conflicts {
            paths: vec!["/a".into()],
        };
        assert_eq!(err.affected_paths(), ["/a".to_string()]);
        assert!(SyncError::LockLost.affected_paths().is_empty());
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = StorageError::NotFound("/x".into()).into();
        assert!(matches!(err, CoreError::Storage(_)));

        let db_err = DatabaseError::NotFound {
            entity: "conflict".into(),
            id: "abc".into(),
        };
        let err: CoreError = db_err.into();
        assert!(matches!(err, CoreError::Database(_)));
    }
}
