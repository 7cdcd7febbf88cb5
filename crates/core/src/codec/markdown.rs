//! One-file-per-artifact layout under `snippets/`.
//!
//! A snippet at `/work/hello` becomes `snippets/work/hello.md`:
//!
//! ````text
//! +++
//! name = "hello"
//! language = "rust"
//! order = 0
//! created_at = "2025-01-01T00:00:00Z"
//! +++
//!
//! ```rust
//! fn main() {}
//! ```
//! ````
//!
//! The fence is always longer than the longest backtick run in the body, so
//! any body round-trips byte for byte. A directory at `/work` becomes
//! `snippets/work/.directory.toml`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{has_conflict_markers, validate_full_path, FileSet, WorkingTreeCodec};
use crate::errors::CodecError;
use crate::models::{sort_by_path, Artifact, Directory, Snippet};

pub const ROOT_DIR: &str = "snippets";
const SNIPPET_EXT: &str = ".md";
const DIRECTORY_FILE: &str = ".directory.toml";
const FRONT_MATTER: &str = "+++";

#[derive(Debug, Serialize, Deserialize)]
struct SnippetMeta {
    name: String,
    language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
    #[serde(default)]
    order: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectoryMeta {
    name: String,
    #[serde(default)]
    order: i64,
}

/// Markdown files with TOML front matter, one per artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownCodec;

impl WorkingTreeCodec for MarkdownCodec {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn owns(&self, relative_path: &str) -> bool {
        relative_path
            .strip_prefix(ROOT_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| {
                rest.ends_with(SNIPPET_EXT) || rest == DIRECTORY_FILE || rest.ends_with(&format!("/{DIRECTORY_FILE}"))
            })
    }

    fn encode(&self, artifacts: &[Artifact]) -> Result<FileSet, CodecError> {
        let mut files = FileSet::new();
        for artifact in artifacts {
            let (path, text) = match artifact {
                Artifact::Snippet(s) => (snippet_file(&s.full_path)?, encode_snippet(s)?),
                Artifact::Directory(d) => (directory_file(&d.full_path)?, encode_directory(d)?),
            };
            files.insert(path, text);
        }
        Ok(files)
    }

    fn decode(&self, files: &FileSet) -> Result<Vec<Artifact>, CodecError> {
        let mut artifacts = Vec::new();
        for (path, text) in files.iter().filter(|(p, _)| self.owns(p)) {
            if self.has_unresolved_markers(path, text) {
                return Err(CodecError::ConflictMarkers(path.clone()));
            }
            let relative = &path[ROOT_DIR.len() + 1..];

            let artifact = if let Some(dir) = relative.strip_suffix(DIRECTORY_FILE) {
                let full_path = format!("/{}", dir.trim_end_matches('/'));
                validate_full_path(&full_path)?;
                decode_directory(path, full_path, text)?
            } else {
                let stem = relative.strip_suffix(SNIPPET_EXT).unwrap_or(relative);
                let full_path = format!("/{stem}");
                validate_full_path(&full_path)?;
                decode_snippet(path, full_path, text)?
            };
            artifacts.push(artifact);
        }

        sort_by_path(&mut artifacts);
        debug!(count = artifacts.len(), "decoded markdown working tree");
        Ok(artifacts)
    }

    /// Markers count only outside the fenced body. A file that no longer
    /// parses is checked as a whole.
    fn has_unresolved_markers(&self, relative_path: &str, text: &str) -> bool {
        if relative_path.ends_with(DIRECTORY_FILE) {
            return has_conflict_markers(text);
        }
        match split_snippet(text) {
            Ok(parts) => has_conflict_markers(parts.front),
            Err(_) => has_conflict_markers(text),
        }
    }
}

fn snippet_file(full_path: &str) -> Result<String, CodecError> {
    validate_full_path(full_path)?;
    Ok(format!("{ROOT_DIR}{full_path}{SNIPPET_EXT}"))
}

fn directory_file(full_path: &str) -> Result<String, CodecError> {
    validate_full_path(full_path)?;
    Ok(format!("{ROOT_DIR}{full_path}/{DIRECTORY_FILE}"))
}

fn encode_snippet(s: &Snippet) -> Result<String, CodecError> {
    let meta = SnippetMeta {
        name: s.name.clone(),
        language: s.language.clone(),
        file_name: s.file_name.clone(),
        order: s.order,
        created_at: s.created_at,
    };
    let front = toml::to_string(&meta).map_err(|e| CodecError::Metadata {
        path: s.full_path.clone(),
        detail: e.to_string(),
    })?;
    let fence = fence_for(&s.body);
    Ok(format!(
        "{FRONT_MATTER}\n{front}{FRONT_MATTER}\n\n{fence}{lang}\n{body}\n{fence}\n",
        lang = s.language,
        body = s.body,
    ))
}

fn encode_directory(d: &Directory) -> Result<String, CodecError> {
    let meta = DirectoryMeta {
        name: d.name.clone(),
        order: d.order,
    };
    toml::to_string(&meta).map_err(|e| CodecError::Metadata {
        path: d.full_path.clone(),
        detail: e.to_string(),
    })
}

fn decode_directory(file: &str, full_path: String, text: &str) -> Result<Artifact, CodecError> {
    let meta: DirectoryMeta = toml::from_str(text).map_err(|e| CodecError::Metadata {
        path: file.to_string(),
        detail: e.to_string(),
    })?;
    Ok(Directory {
        full_path,
        name: meta.name,
        order: meta.order,
    }
    .into())
}

/// The two halves of a snippet file: TOML front matter and fenced body.
struct SnippetParts<'a> {
    front: &'a str,
    body: &'a str,
}

fn split_snippet(text: &str) -> Result<SnippetParts<'_>, &'static str> {
    let after_open = text
        .strip_prefix(FRONT_MATTER)
        .and_then(|t| t.strip_prefix('\n'))
        .ok_or("missing front matter")?;
    let close = format!("\n{FRONT_MATTER}\n");
    let (front, rest) = match after_open.strip_prefix(&close[1..]) {
        // Empty front matter block.
        Some(rest) => ("", rest),
        None => {
            let end = after_open.find(&close).ok_or("unterminated front matter")?;
            (&after_open[..end + 1], &after_open[end + close.len()..])
        }
    };

    let rest = rest.trim_start_matches('\n');
    let (open_line, after_fence) = rest.split_once('\n').ok_or("missing code block")?;
    let fence_len = open_line.chars().take_while(|c| *c == '`').count();
    if fence_len < 3 {
        return Err("missing opening fence");
    }
    let fence = "`".repeat(fence_len);

    let body = if after_fence == format!("{fence}\n") || after_fence == fence {
        // Unreachable through `encode`, which always writes a body line.
        ""
    } else {
        let closing = format!("\n{fence}\n");
        after_fence
            .strip_suffix(closing.as_str())
            .or_else(|| after_fence.strip_suffix(&closing[..closing.len() - 1]))
            .ok_or("missing closing fence")?
    };
    Ok(SnippetParts { front, body })
}

fn decode_snippet(file: &str, full_path: String, text: &str) -> Result<Artifact, CodecError> {
    let parts = split_snippet(text).map_err(|detail| CodecError::Malformed {
        path: file.to_string(),
        detail: detail.to_string(),
    })?;
    let meta: SnippetMeta = toml::from_str(parts.front).map_err(|e| CodecError::Metadata {
        path: file.to_string(),
        detail: e.to_string(),
    })?;

    Ok(Snippet {
        full_path,
        name: meta.name,
        body: parts.body.to_string(),
        language: meta.language,
        file_name: meta.file_name,
        order: meta.order,
        created_at: meta.created_at,
    }
    .into())
}

/// A backtick fence longer than any backtick run in `body` (minimum three).
fn fence_for(body: &str) -> String {
    let longest = body
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    "`".repeat((longest + 1).max(3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap()
    }

    fn round_trip(artifacts: Vec<Artifact>) {
        let files = MarkdownCodec.encode(&artifacts).unwrap();
        let mut expected = artifacts;
        sort_by_path(&mut expected);
        assert_eq!(MarkdownCodec.decode(&files).unwrap(), expected);
    }

    #[test]
    fn test_layout() {
        let mut s = Snippet::new("/work/hello", "fn main() {}", "rust").with_created_at(at());
        s.file_name = Some("main.rs".into());
        let files = MarkdownCodec
            .encode(&[Directory::new("/work").into(), s.into()])
            .unwrap();

        let keys: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["snippets/work/.directory.toml", "snippets/work/hello.md"]);

        let text = &files["snippets/work/hello.md"];
        assert!(text.starts_with("+++\nname = \"hello\"\n"));
        assert!(text.ends_with("\n```rust\nfn main() {}\n```\n"));
    }

    #[test]
    fn test_bodies_round_trip_exactly() {
        for body in [
            "",
            "one line",
            "trailing newline\n",
            "\n\nleading blank lines",
            "two trailing\n\n",
            "has ``` a fence\n```\nand more",
            "````\nfour\n````",
            "+++\nlooks like front matter\n+++\n",
            "crlf\r\nline\r\n",
        ] {
            round_trip(vec![Snippet::new("/s", body, "text").with_created_at(at()).into()]);
        }
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut s = Snippet::new("/deep/path/x", "body", "python").with_created_at(at());
        s.name = "Display Name".into();
        s.order = 7;
        s.file_name = Some("util.py".into());
        let d = Directory {
            name: "Deep Folder".into(),
            order: 2,
            ..Directory::new("/deep")
        };
        round_trip(vec![s.into(), d.into(), Directory::new("/deep/path").into()]);
    }

    #[test]
    fn test_fence_longer_than_body_runs() {
        assert_eq!(fence_for("plain"), "```");
        assert_eq!(fence_for("a ``` b"), "````");
        assert_eq!(fence_for("`````"), "``````");
    }

    #[test]
    fn test_ignores_unowned_files() {
        let mut files = MarkdownCodec
            .encode(&[Snippet::new("/a", "x", "text").with_created_at(at()).into()])
            .unwrap();
        files.insert("README.md".into(), "# notes".into());
        files.insert("snippets/notes.txt".into(), "stray".into());
        assert_eq!(MarkdownCodec.decode(&files).unwrap().len(), 1);
        assert!(!MarkdownCodec.owns("README.md"));
        assert!(MarkdownCodec.owns("snippets/a.md"));
        assert!(MarkdownCodec.owns("snippets/a/.directory.toml"));
    }

    #[test]
    fn test_rejects_conflict_markers() {
        let files = FileSet::from([(
            "snippets/a.md".to_string(),
            "+++\nname = \"a\"\n<<<<<<< HEAD\n".to_string(),
        )]);
        assert!(matches!(MarkdownCodec.decode(&files), Err(CodecError::ConflictMarkers(_))));
    }

    #[test]
    fn test_marker_lines_in_body_round_trip() {
        let body = "<<<<<<< HEAD\nours\n=======\ntheirs\n>>>>>>> branch\n";
        round_trip(vec![Snippet::new("/git-cheatsheet", body, "text").with_created_at(at()).into()]);

        let files = MarkdownCodec
            .encode(&[Snippet::new("/git-cheatsheet", body, "text").with_created_at(at()).into()])
            .unwrap();
        let text = &files["snippets/git-cheatsheet.md"];
        assert!(!MarkdownCodec.has_unresolved_markers("snippets/git-cheatsheet.md", text));
    }

    #[test]
    fn test_markers_in_front_matter_are_unresolved() {
        let text = "+++\n<<<<<<< HEAD\nname = \"a\"\n=======\nname = \"b\"\n>>>>>>> theirs\nlanguage = \"text\"\n+++\n\n```text\nx\n```\n";
        assert!(MarkdownCodec.has_unresolved_markers("snippets/a.md", text));
        assert!(MarkdownCodec.has_unresolved_markers("snippets/a/.directory.toml", "<<<<<<< HEAD\n"));
    }

    #[test]
    fn test_rejects_unsafe_paths() {
        let files = FileSet::from([("snippets/../escape.md".to_string(), "x".to_string())]);
        assert!(matches!(MarkdownCodec.decode(&files), Err(CodecError::InvalidPath(_))));
        assert!(MarkdownCodec.encode(&[Snippet {
            full_path: "/a/../b".into(),
            ..Snippet::new("/b", "", "text")
        }
        .into()])
        .is_err());
    }

    #[test]
    fn test_malformed_file() {
        let files = FileSet::from([("snippets/a.md".to_string(), "no front matter".to_string())]);
        assert!(matches!(MarkdownCodec.decode(&files), Err(CodecError::Malformed { .. })));
    }
}
