//! Single-document JSON layout: everything lives in `snippets.json`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{reject_conflict_markers, validate_full_path, FileSet, WorkingTreeCodec};
use crate::errors::CodecError;
use crate::models::{sort_by_path, Artifact, Directory, Snippet};

pub const DOCUMENT_FILE: &str = "snippets.json";
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u32,
    #[serde(default)]
    directories: Vec<Directory>,
    #[serde(default)]
    snippets: Vec<Snippet>,
}

/// Writes the collection as one pretty-printed JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl WorkingTreeCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn owns(&self, relative_path: &str) -> bool {
        relative_path == DOCUMENT_FILE
    }

    fn encode(&self, artifacts: &[Artifact]) -> Result<FileSet, CodecError> {
        let mut sorted = artifacts.to_vec();
        sort_by_path(&mut sorted);

        let mut doc = Document {
            version: DOCUMENT_VERSION,
            directories: Vec::new(),
            snippets: Vec::new(),
        };
        for artifact in sorted {
            match artifact {
                Artifact::Directory(d) => doc.directories.push(d),
                Artifact::Snippet(s) => doc.snippets.push(s),
            }
        }

        let mut text = serde_json::to_string_pretty(&doc)?;
        text.push('\n');
        Ok(FileSet::from([(DOCUMENT_FILE.to_string(), text)]))
    }

    fn decode(&self, files: &FileSet) -> Result<Vec<Artifact>, CodecError> {
        let Some(text) = files.get(DOCUMENT_FILE) else {
            debug!("no snippet document in working tree");
            return Ok(Vec::new());
        };
        reject_conflict_markers(DOCUMENT_FILE, text)?;

        let doc: Document = serde_json::from_str(text)?;
        if doc.version != DOCUMENT_VERSION {
            return Err(CodecError::Malformed {
                path: DOCUMENT_FILE.to_string(),
                detail: format!("unsupported document version {}", doc.version),
            });
        }

        let mut artifacts: Vec<Artifact> = doc
            .directories
            .into_iter()
            .map(Artifact::from)
            .chain(doc.snippets.into_iter().map(Artifact::from))
            .collect();
        for artifact in &artifacts {
            validate_full_path(artifact.full_path())?;
        }
        sort_by_path(&mut artifacts);
        Ok(artifacts)
    }
}
