//! The codec-owned part of the repository working tree.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::codec::{FileSet, WorkingTreeCodec};
use crate::errors::CodecError;
use crate::models::Artifact;

/// Reads and writes the files a codec owns inside a working tree. Other
/// files (and `.git`) are left alone.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every codec-owned file, keyed by slash-separated relative path.
    pub fn read(&self, codec: &dyn WorkingTreeCodec) -> Result<FileSet, CodecError> {
        let mut files = FileSet::new();
        if self.root.exists() {
            self.collect(&self.root, codec, &mut files)?;
        }
        Ok(files)
    }

    fn collect(&self, dir: &Path, codec: &dyn WorkingTreeCodec, out: &mut FileSet) -> Result<(), CodecError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if entry.file_name() != ".git" {
                    self.collect(&path, codec, out)?;
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let Some(relative) = self.relative(&path) else {
                continue;
            };
            if !codec.owns(&relative) {
                continue;
            }
            let bytes = fs::read(&path)?;
            let text = String::from_utf8(bytes).map_err(|_| CodecError::Malformed {
                path: relative.clone(),
                detail: "not valid UTF-8".into(),
            })?;
            out.insert(relative, text);
        }
        Ok(())
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }

    /// Write `artifacts` through `codec`, touching only files whose content
    /// differs and removing owned files that are no longer produced.
    /// Returns the number of files written or removed; a second call with
    /// the same input returns 0.
    pub fn stage(&self, codec: &dyn WorkingTreeCodec, artifacts: &[Artifact]) -> Result<usize, CodecError> {
        let wanted = codec.encode(artifacts)?;
        let existing = self.read(codec)?;
        let mut touched = 0;

        for (relative, text) in &wanted {
            if existing.get(relative) == Some(text) {
                continue;
            }
            let path = self.root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, text)?;
            debug!(file = %relative, "staged file");
            touched += 1;
        }

        for relative in existing.keys().filter(|k| !wanted.contains_key(*k)) {
            let path = self.root.join(relative);
            fs::remove_file(&path)?;
            self.prune_empty_parents(&path)?;
            debug!(file = %relative, "removed file");
            touched += 1;
        }

        Ok(touched)
    }

    fn prune_empty_parents(&self, removed: &Path) -> Result<(), CodecError> {
        let mut dir = removed.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            if fs::read_dir(d)?.next().is_some() {
                break;
            }
            fs::remove_dir(d)?;
            dir = d.parent();
        }
        Ok(())
    }

    /// Decode the artifacts currently in the working tree.
    pub fn load(&self, codec: &dyn WorkingTreeCodec) -> Result<Vec<Artifact>, CodecError> {
        codec.decode(&self.read(codec)?)
    }

    /// Owned files still carrying merge conflict markers.
    pub fn conflict_marked_paths(&self, codec: &dyn WorkingTreeCodec) -> Result<Vec<String>, CodecError> {
        Ok(self
            .read(codec)?
            .into_iter()
            .filter(|(path, text)| codec.has_unresolved_markers(path, text))
            .map(|(path, _)| path)
            .collect())
    }
}
