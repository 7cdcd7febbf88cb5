//! In-memory artifact store.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use super::ArtifactStore;
use crate::errors::StorageError;
use crate::models::{Artifact, ArtifactKind, Directory, Snippet};

/// A [`BTreeMap`]-backed store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, Artifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifacts(artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        let items = artifacts
            .into_iter()
            .map(|a| (a.full_path().to_string(), a))
            .collect();
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Artifact>> {
        self.items.read().unwrap_or_else(|poisoned| {
            warn!("memory store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Artifact>> {
        self.items.write().unwrap_or_else(|poisoned| {
            warn!("memory store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn insert_new(&self, artifact: Artifact) -> Result<(), StorageError> {
        let mut items = self.write();
        let path = artifact.full_path().to_string();
        if items.contains_key(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        items.insert(path, artifact);
        Ok(())
    }

    fn remove_kind(&self, full_path: &str, kind: ArtifactKind) -> Result<(), StorageError> {
        let mut items = self.write();
        match items.get(full_path) {
            Some(existing) if existing.kind() == kind => {
                items.remove(full_path);
                Ok(())
            }
            _ => Err(StorageError::NotFound(full_path.to_string())),
        }
    }
}

impl ArtifactStore for MemoryStore {
    fn list(&self, kind: ArtifactKind) -> Result<Vec<Artifact>, StorageError> {
        Ok(self
            .read()
            .values()
            .filter(|a| a.kind() == kind)
            .cloned()
            .collect())
    }

    fn save_snippet(&self, snippet: &Snippet) -> Result<(), StorageError> {
        self.insert_new(snippet.clone().into())
    }

    fn update_snippet(&self, snippet: &Snippet) -> Result<(), StorageError> {
        let mut items = self.write();
        match items.get_mut(&snippet.full_path) {
            Some(slot) if slot.kind() == ArtifactKind::Snippet => {
                *slot = snippet.clone().into();
                Ok(())
            }
            _ => Err(StorageError::NotFound(snippet.full_path.clone())),
        }
    }

    fn delete_snippet(&self, full_path: &str) -> Result<(), StorageError> {
        self.remove_kind(full_path, ArtifactKind::Snippet)
    }

    fn create_directory(&self, directory: &Directory) -> Result<(), StorageError> {
        self.insert_new(directory.clone().into())
    }

    fn delete_directory(&self, full_path: &str) -> Result<(), StorageError> {
        self.remove_kind(full_path, ArtifactKind::Directory)
    }
}
