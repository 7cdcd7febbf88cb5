//! Working-tree serialization of the artifact collection.
//!
//! A [`WorkingTreeCodec`] maps an artifact set to the text files committed to
//! the repository and back. Two layouts are provided: [`JsonCodec`] writes a
//! single document, [`MarkdownCodec`] writes one file per artifact. Both are
//! deterministic and lossless for every artifact field.

pub mod json;
pub mod markdown;

pub use json::JsonCodec;
pub use markdown::MarkdownCodec;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::models::Artifact;

/// Relative file path (forward slashes) to file contents.
pub type FileSet = BTreeMap<String, String>;

/// Serializes artifacts to working-tree files and back.
pub trait WorkingTreeCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the file at `relative_path` is managed by this codec. Files
    /// outside this set (README, .gitignore, ...) are never touched.
    fn owns(&self, relative_path: &str) -> bool;

    fn encode(&self, artifacts: &[Artifact]) -> Result<FileSet, CodecError>;

    /// Decode owned files. Files the codec does not own are ignored.
    fn decode(&self, files: &FileSet) -> Result<Vec<Artifact>, CodecError>;

    /// Whether the owned file still carries merge markers in text the codec
    /// itself writes. Marker-like lines inside artifact content do not count.
    fn has_unresolved_markers(&self, _relative_path: &str, text: &str) -> bool {
        has_conflict_markers(text)
    }
}

/// On-disk layout selected in the configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepoFormat {
    #[default]
    Markdown,
    Json,
}

impl std::fmt::Display for RepoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Markdown => write!(f, "markdown"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Build the codec for `format`.
pub fn codec_for(format: RepoFormat) -> Box<dyn WorkingTreeCodec> {
    match format {
        RepoFormat::Markdown => Box::new(MarkdownCodec),
        RepoFormat::Json => Box::new(JsonCodec),
    }
}

static CONFLICT_MARKER: OnceLock<Regex> = OnceLock::new();

/// True if `text` has a line starting a `<<<<<<<` or `>>>>>>>` merge marker.
pub fn has_conflict_markers(text: &str) -> bool {
    CONFLICT_MARKER
        .get_or_init(|| Regex::new(r"(?m)^(<{7}|>{7})(\s|$)").expect("conflict marker pattern is valid"))
        .is_match(text)
}

/// Check an artifact path read from the working tree.
///
/// Paths must be absolute, non-root, and free of empty, `.` and `..`
/// segments.
pub(crate) fn validate_full_path(path: &str) -> Result<(), CodecError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(CodecError::InvalidPath(path.to_string()));
    };
    if rest.is_empty() || rest.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(CodecError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Reject a file that still carries merge markers.
pub(crate) fn reject_conflict_markers(relative_path: &str, text: &str) -> Result<(), CodecError> {
    if has_conflict_markers(text) {
        return Err(CodecError::ConflictMarkers(relative_path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_marker_detection() {
        assert!(has_conflict_markers("a\n<<<<<<< HEAD\nb\n=======\nc\n>>>>>>> theirs\n"));
        assert!(has_conflict_markers(">>>>>>>\n"));
        assert!(!has_conflict_markers("a << b\n"));
        assert!(!has_conflict_markers("  <<<<<<< indented is content\n"));
        assert!(!has_conflict_markers("<<<<<<<<< eight\n"));
    }

    #[test]
    fn test_validate_full_path() {
        assert!(validate_full_path("/work/hello").is_ok());
        assert!(validate_full_path("work/hello").is_err());
        assert!(validate_full_path("/").is_err());
        assert!(validate_full_path("/a//b").is_err());
        assert!(validate_full_path("/a/../b").is_err());
        assert!(validate_full_path("/a/./b").is_err());
    }

    #[test]
    fn test_codec_for_format() {
        assert_eq!(codec_for(RepoFormat::Json).name(), "json");
        assert_eq!(codec_for(RepoFormat::Markdown).name(), "markdown");
    }
}
