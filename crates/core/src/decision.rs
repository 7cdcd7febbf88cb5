//! The user-decision channel.
//!
//! The engine asks for a decision at exactly two points: when local storage is
//! empty but the remote is not, and when a conflict cannot be resolved
//! automatically. An answer of `None` means no decision is available; the
//! engine then suspends or halts and never picks a default on its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conflict::Conflict;
use crate::models::Artifact;

/// Answer to "local is empty, remote has data".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyLocalChoice {
    /// Replace local storage with the remote collection.
    PullRemote,
    /// Publish the empty local collection, deleting the remote artifacts.
    ForceOverwrite,
    /// Stop the cycle without touching either side.
    Cancel,
}

impl std::fmt::Display for EmptyLocalChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PullRemote => write!(f, "pull_remote"),
            Self::ForceOverwrite => write!(f, "force_overwrite"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Answer to an unresolved conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
    /// Use this body, with the remote side's metadata.
    UseContent(String),
    /// Leave it pending; the cycle halts.
    Defer,
}

/// Callbacks the orchestrator uses when it cannot proceed unattended.
#[async_trait]
pub trait DecisionChannel: Send + Sync {
    async fn on_empty_local(&self, remote_count: usize) -> Option<EmptyLocalChoice>;

    /// `placeholder` is what the merged set holds for the path until decided.
    async fn on_conflict(
        &self,
        conflict: &Conflict,
        placeholder: Option<&Artifact>,
    ) -> Option<ConflictChoice>;

    /// Whether the user is actively working on any of `paths` (e.g. has a
    /// conflicted file open). Blocks automatic cleanup of a stale merge.
    async fn is_editing(&self, _paths: &[String]) -> bool {
        false
    }
}

/// Channel for unattended runs: never has an answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

#[async_trait]
impl DecisionChannel for Unattended {
    async fn on_empty_local(&self, _remote_count: usize) -> Option<EmptyLocalChoice> {
        None
    }

    async fn on_conflict(
        &self,
        _conflict: &Conflict,
        _placeholder: Option<&Artifact>,
    ) -> Option<ConflictChoice> {
        None
    }
}

/// Channel with fixed answers, for scripted runs (`--yes-pull`) and tests.
#[derive(Debug, Clone, Default)]
pub struct Preset {
    pub empty_local: Option<EmptyLocalChoice>,
    pub conflict: Option<ConflictChoice>,
    pub editing: bool,
}

#[async_trait]
impl DecisionChannel for Preset {
    async fn on_empty_local(&self, _remote_count: usize) -> Option<EmptyLocalChoice> {
        self.empty_local
    }

    async fn on_conflict(
        &self,
        _conflict: &Conflict,
        _placeholder: Option<&Artifact>,
    ) -> Option<ConflictChoice> {
        self.conflict.clone()
    }

    async fn is_editing(&self, _paths: &[String]) -> bool {
        self.editing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictType;

    fn conflict() -> Conflict {
        Conflict {
            full_path: "/a".into(),
            conflict_type: ConflictType::ModifyModify,
            local: None,
            remote: None,
            baseline: None,
        }
    }

    #[tokio::test]
    async fn test_unattended_never_decides() {
        let channel = Unattended;
        assert_eq!(channel.on_empty_local(10).await, None);
        assert_eq!(channel.on_conflict(&conflict(), None).await, None);
        assert!(!channel.is_editing(&["/a".to_string()]).await);
    }

    #[tokio::test]
    async fn test_preset_answers() {
        let channel = Preset {
            empty_local: Some(EmptyLocalChoice::PullRemote),
            conflict: Some(ConflictChoice::KeepRemote),
            editing: true,
        };
        assert_eq!(channel.on_empty_local(3).await, Some(EmptyLocalChoice::PullRemote));
        assert_eq!(
            channel.on_conflict(&conflict(), None).await,
            Some(ConflictChoice::KeepRemote)
        );
        assert!(channel.is_editing(&[]).await);
    }
}
