//! Per-conflict resolution policy.
//!
//! The [`ConflictResolver`] settles what it safely can and marks the rest as
//! needing a manual decision, keeping a placeholder artifact in the meantime.
//!
//! Snippets: a lone non-empty side wins; identical bodies go to the newer
//! timestamp (ties favour local); differing bodies go to the configured
//! [`ContentMerger`]. Directories carry no content, so remote wins unless
//! local directories are protected.

use chrono::Utc;
use tracing::{debug, info};

use super::classifier::Conflict;
use super::merger::{ContentMerger, HeuristicMerger, MergeInput, MergeMethod, MergeResult};
use crate::decision::ConflictChoice;
use crate::models::{Artifact, ArtifactKind, Snippet};

/// Which rule settled a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionRule {
    /// Only one side had content.
    NonEmptySide,
    /// Bodies matched; the newer side's metadata was kept.
    NewerIdentical,
    /// The content merger produced a body.
    Merged(MergeMethod),
    RemoteDirectory,
    LocalDirectory,
    /// Decided through the decision channel.
    UserChoice,
}

impl std::fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonEmptySide => write!(f, "non_empty_side"),
            Self::NewerIdentical => write!(f, "newer_identical"),
            Self::Merged(method) => write!(f, "merged:{method}"),
            Self::RemoteDirectory => write!(f, "remote_directory"),
            Self::LocalDirectory => write!(f, "local_directory"),
            Self::UserChoice => write!(f, "user_choice"),
        }
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `artifact` is the merged state of the path; `None` means it is deleted.
    Resolved {
        artifact: Option<Artifact>,
        rule: ResolutionRule,
    },
    /// Needs an external decision. `placeholder` stands in until then.
    NeedsManual {
        placeholder: Option<Artifact>,
        reason: String,
    },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    /// The artifact the merged set should hold for this path.
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Resolved { artifact, .. } => artifact.as_ref(),
            Self::NeedsManual { placeholder, .. } => placeholder.as_ref(),
        }
    }
}

/// Applies the resolution policy with a pluggable merger.
pub struct ConflictResolver {
    merger: Box<dyn ContentMerger>,
    protect_local_directories: bool,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Box::new(HeuristicMerger::default()), false)
    }
}

impl ConflictResolver {
    pub fn new(merger: Box<dyn ContentMerger>, protect_local_directories: bool) -> Self {
        Self {
            merger,
            protect_local_directories,
        }
    }

    pub fn merger_name(&self) -> &'static str {
        self.merger.name()
    }

    /// Resolve one conflict automatically, or say why it cannot be.
    pub fn resolve(&self, conflict: &Conflict) -> Resolution {
        let kinds: Vec<ArtifactKind> = [&conflict.local, &conflict.remote]
            .into_iter()
            .flatten()
            .map(Artifact::kind)
            .collect();

        let resolution = if kinds.contains(&ArtifactKind::Snippet) && kinds.contains(&ArtifactKind::Directory) {
            Resolution::NeedsManual {
                placeholder: conflict.local.clone().or_else(|| conflict.remote.clone()),
                reason: "a snippet and a directory claim the same path".into(),
            }
        } else if kinds.contains(&ArtifactKind::Directory) {
            self.resolve_directory(conflict)
        } else {
            self.resolve_snippet(conflict)
        };

        debug!(
            path = %conflict.full_path,
            conflict_type = %conflict.conflict_type,
            resolved = resolution.is_resolved(),
            "conflict resolution attempted"
        );
        resolution
    }

    fn resolve_directory(&self, conflict: &Conflict) -> Resolution {
        if self.protect_local_directories {
            Resolution::Resolved {
                artifact: conflict.local.clone(),
                rule: ResolutionRule::LocalDirectory,
            }
        } else {
            Resolution::Resolved {
                artifact: conflict.remote.clone(),
                rule: ResolutionRule::RemoteDirectory,
            }
        }
    }

    fn resolve_snippet(&self, conflict: &Conflict) -> Resolution {
        let local = conflict.local.as_ref().and_then(Artifact::as_snippet);
        let remote = conflict.remote.as_ref().and_then(Artifact::as_snippet);

        let (l, r) = match (local, remote) {
            (Some(l), Some(r)) if has_content(l) && has_content(r) => (l, r),
            (local, remote) => {
                let keep = match (
                    local.filter(|s| has_content(s)),
                    remote.filter(|s| has_content(s)),
                ) {
                    (Some(l), None) => Some(l),
                    (None, Some(r)) => Some(r),
                    // Nothing to lose on either side; keep whichever exists.
                    _ => match (local, remote) {
                        (Some(l), Some(r)) => Some(newer(l, r)),
                        (l, r) => l.or(r),
                    },
                };
                return resolved(keep, ResolutionRule::NonEmptySide);
            }
        };

        if l.body == r.body {
            return resolved(Some(newer(l, r)), ResolutionRule::NewerIdentical);
        }

        let base = conflict.baseline.as_ref().and_then(Artifact::body);
        let input = MergeInput::new(&l.body, &r.body)
            .with_times(Some(l.created_at), Some(r.created_at))
            .with_base(base);

        match self.merger.merge(&input) {
            MergeResult::Merged { content, method } => {
                if method.is_lossy() {
                    info!(path = %conflict.full_path, %method, "lossy automatic merge applied");
                }
                let mut merged = r.clone();
                merged.body = content;
                merged.created_at = l.created_at.max(r.created_at);
                Resolution::Resolved {
                    artifact: Some(merged.into()),
                    rule: ResolutionRule::Merged(method),
                }
            }
            MergeResult::Conflict { reason } => Resolution::NeedsManual {
                placeholder: Some(newer(l, r).clone().into()),
                reason,
            },
        }
    }

    /// Turn an external decision into a resolution.
    pub fn apply_choice(conflict: &Conflict, choice: &ConflictChoice) -> Resolution {
        match choice {
            ConflictChoice::KeepLocal => Resolution::Resolved {
                artifact: conflict.local.clone(),
                rule: ResolutionRule::UserChoice,
            },
            ConflictChoice::KeepRemote => Resolution::Resolved {
                artifact: conflict.remote.clone(),
                rule: ResolutionRule::UserChoice,
            },
            ConflictChoice::UseContent(body) => {
                let template = [&conflict.remote, &conflict.local, &conflict.baseline]
                    .into_iter()
                    .flatten()
                    .find_map(Artifact::as_snippet);
                match template {
                    Some(template) => {
                        let mut snippet = template.clone();
                        snippet.body = body.clone();
                        snippet.created_at = Utc::now();
                        Resolution::Resolved {
                            artifact: Some(snippet.into()),
                            rule: ResolutionRule::UserChoice,
                        }
                    }
                    None => Resolution::NeedsManual {
                        placeholder: conflict.remote.clone().or_else(|| conflict.local.clone()),
                        reason: "content cannot be applied to a directory".into(),
                    },
                }
            }
            ConflictChoice::Defer => Resolution::NeedsManual {
                placeholder: conflict.local.clone().or_else(|| conflict.remote.clone()),
                reason: "resolution deferred".into(),
            },
        }
    }
}

fn has_content(snippet: &Snippet) -> bool {
    !snippet.body.trim().is_empty()
}

/// The later-timestamped snippet; ties favour `local`.
fn newer<'a>(local: &'a Snippet, remote: &'a Snippet) -> &'a Snippet {
    if remote.created_at > local.created_at {
        remote
    } else {
        local
    }
}

fn resolved(snippet: Option<&Snippet>, rule: ResolutionRule) -> Resolution {
    Resolution::Resolved {
        artifact: snippet.cloned().map(Artifact::from),
        rule,
    }
}
