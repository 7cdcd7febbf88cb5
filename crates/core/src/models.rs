//! Domain model types used throughout SnipSync.
//!
//! An [`Artifact`] is either a [`Snippet`] or a [`Directory`], identified by
//! its slash-delimited `full_path`. The path is the only identity the merge
//! engine relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Which kind of artifact a store query is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Snippet,
    Directory,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snippet => write!(f, "snippet"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// A named text body with a language tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snippet {
    pub full_path: String,
    pub name: String,
    pub body: String,
    pub language: String,
    /// Originating file name or category. Cosmetic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub order: i64,
    /// Version timestamp; only ever used as a tie-breaker.
    pub created_at: DateTime<Utc>,
}

impl Snippet {
    /// Build a snippet whose name is the last path segment.
    pub fn new(full_path: &str, body: impl Into<String>, language: impl Into<String>) -> Self {
        let full_path = normalize_path(full_path);
        Self {
            name: leaf_name(&full_path).to_string(),
            full_path,
            body: body.into(),
            language: language.into(),
            file_name: None,
            order: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A folder grouping snippets. Structural metadata only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Directory {
    pub full_path: String,
    pub name: String,
    #[serde(default)]
    pub order: i64,
}

impl Directory {
    pub fn new(full_path: &str) -> Self {
        let full_path = normalize_path(full_path);
        Self {
            name: leaf_name(&full_path).to_string(),
            full_path,
            order: 0,
        }
    }
}

/// Either kind of synchronized item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Snippet(Snippet),
    Directory(Directory),
}

impl Artifact {
    pub fn full_path(&self) -> &str {
        match self {
            Self::Snippet(s) => &s.full_path,
            Self::Directory(d) => &d.full_path,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Snippet(s) => &s.name,
            Self::Directory(d) => &d.name,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Snippet(_) => ArtifactKind::Snippet,
            Self::Directory(_) => ArtifactKind::Directory,
        }
    }

    pub fn as_snippet(&self) -> Option<&Snippet> {
        match self {
            Self::Snippet(s) => Some(s),
            Self::Directory(_) => None,
        }
    }

    /// Snippet body, `None` for directories.
    pub fn body(&self) -> Option<&str> {
        self.as_snippet().map(|s| s.body.as_str())
    }

    /// Snippet timestamp, `None` for directories.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.as_snippet().map(|s| s.created_at)
    }

    /// Equality over the fields a user edits.
    ///
    /// Order hints and timestamps are ignored, so reordering a folder or
    /// re-saving an unchanged snippet is not a change.
    pub fn content_eq(&self, other: &Artifact) -> bool {
        match (self, other) {
            (Self::Snippet(a), Self::Snippet(b)) => {
                a.name == b.name
                    && a.body == b.body
                    && a.language == b.language
                    && a.file_name == b.file_name
            }
            (Self::Directory(a), Self::Directory(b)) => a.name == b.name,
            _ => false,
        }
    }

    /// Path segments above this artifact, nearest last (`/a/b/c` → `/a`, `/a/b`).
    pub fn ancestor_paths(&self) -> Vec<String> {
        ancestor_paths(self.full_path())
    }
}

impl From<Snippet> for Artifact {
    fn from(s: Snippet) -> Self {
        Self::Snippet(s)
    }
}

impl From<Directory> for Artifact {
    fn from(d: Directory) -> Self {
        Self::Directory(d)
    }
}

/// Normalize to a single leading `/`, no trailing `/`, no empty segments.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn leaf_name(full_path: &str) -> &str {
    full_path.rsplit('/').next().unwrap_or(full_path)
}

/// Ancestor paths of `full_path`, outermost first.
pub fn ancestor_paths(full_path: &str) -> Vec<String> {
    let segments: Vec<&str> = full_path.split('/').filter(|s| !s.is_empty()).collect();
    (1..segments.len())
        .map(|n| format!("/{}", segments[..n].join("/")))
        .collect()
}

/// Sort artifacts by path so every output of the engine is deterministic.
pub fn sort_by_path(artifacts: &mut [Artifact]) {
    artifacts.sort_by(|a, b| a.full_path().cmp(b.full_path()));
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Persisted summary of the sync machinery, as shown to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_syncing: bool,
    pub is_connected: bool,
    pub pending_conflicts: i64,
}

/// Token proving ownership of the sync lock for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleToken {
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }
}
