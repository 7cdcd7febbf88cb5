//! The local artifact store and the transactional updater.
//!
//! [`ArtifactStore`] is the CRUD-by-path contract the engine needs from
//! whatever owns the user's snippets. [`MemoryStore`] and the SQLite-backed
//! [`Database`](crate::db::Database) implement it; [`SafeStorageUpdater`]
//! applies a merged state to any store with backup and rollback.

pub mod memory;
pub mod sqlite;
pub mod updater;

pub use memory::MemoryStore;
pub use updater::{SafeStorageUpdater, UpdatePlan, UpdateReport};

use crate::errors::StorageError;
use crate::models::{sort_by_path, Artifact, ArtifactKind, Directory, Snippet};

/// CRUD by path over snippets and directories.
///
/// Update and delete of a missing path fail with [`StorageError::NotFound`];
/// creating a path that is already taken fails with
/// [`StorageError::AlreadyExists`].
pub trait ArtifactStore: Send + Sync {
    fn list(&self, kind: ArtifactKind) -> Result<Vec<Artifact>, StorageError>;

    fn save_snippet(&self, snippet: &Snippet) -> Result<(), StorageError>;

    fn update_snippet(&self, snippet: &Snippet) -> Result<(), StorageError>;

    fn delete_snippet(&self, full_path: &str) -> Result<(), StorageError>;

    fn create_directory(&self, directory: &Directory) -> Result<(), StorageError>;

    fn delete_directory(&self, full_path: &str) -> Result<(), StorageError>;
}

/// Every artifact in `store`, sorted by path.
pub fn snapshot(store: &dyn ArtifactStore) -> Result<Vec<Artifact>, StorageError> {
    let mut all = store.list(ArtifactKind::Directory)?;
    all.extend(store.list(ArtifactKind::Snippet)?);
    sort_by_path(&mut all);
    Ok(all)
}

/// Create `artifact` with the call matching its kind.
pub(crate) fn create(store: &dyn ArtifactStore, artifact: &Artifact) -> Result<(), StorageError> {
    match artifact {
        Artifact::Snippet(s) => store.save_snippet(s),
        Artifact::Directory(d) => store.create_directory(d),
    }
}

/// Remove `artifact` with the call matching its kind.
pub(crate) fn remove(store: &dyn ArtifactStore, artifact: &Artifact) -> Result<(), StorageError> {
    match artifact {
        Artifact::Snippet(s) => store.delete_snippet(&s.full_path),
        Artifact::Directory(d) => store.delete_directory(&d.full_path),
    }
}
