//! Content merge strategies.
//!
//! Everything that turns two divergent snippet bodies into one sits behind the
//! [`ContentMerger`] trait so the orchestrator never depends on a particular
//! algorithm. [`HeuristicMerger`] is a best-effort policy built on containment
//! checks and a line diff; it favours availability over precision and can lose
//! edits (see [`MergeMethod::is_lossy`]). [`ThreeWayMerger`] is the stricter
//! alternative and needs a common ancestor.

use chrono::{DateTime, Utc};
use diffy::{DiffOptions, Line};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Policy types
// ---------------------------------------------------------------------------

/// How to read "one side's text contains the other's".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainmentPolicy {
    /// A later-timestamped subset is a deliberate deletion; otherwise the
    /// superset is an incremental addition.
    #[default]
    TimestampIntent,
    /// Always keep the superset.
    PreferSuperset,
    /// Never decide; report a conflict.
    Manual,
}

impl std::fmt::Display for ContainmentPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimestampIntent => write!(f, "timestamp_intent"),
            Self::PreferSuperset => write!(f, "prefer_superset"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Which merger the resolver uses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Heuristic,
    ThreeWay,
    ThreeWayThenHeuristic,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heuristic => write!(f, "heuristic"),
            Self::ThreeWay => write!(f, "three_way"),
            Self::ThreeWayThenHeuristic => write!(f, "three_way_then_heuristic"),
        }
    }
}

/// Which rule produced a merged body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    /// One side was empty or whitespace-only.
    EmptySide,
    /// Both sides were identical after line-ending normalisation.
    Identical,
    /// The superset side was kept.
    Superset,
    /// The shorter side was kept as a deliberate deletion.
    SubsetDeletion,
    /// The diff only added lines on one side; the longer text was kept.
    AdditionsOnly,
    /// Small edits in separate regions were stitched together.
    Synthesized,
    /// Clean three-way merge against the common ancestor.
    ThreeWay,
}

impl MergeMethod {
    /// True for rules that may silently drop text from one side.
    pub fn is_lossy(&self) -> bool {
        matches!(
            self,
            Self::EmptySide | Self::Superset | Self::SubsetDeletion | Self::Synthesized
        )
    }
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySide => write!(f, "empty_side"),
            Self::Identical => write!(f, "identical"),
            Self::Superset => write!(f, "superset"),
            Self::SubsetDeletion => write!(f, "subset_deletion"),
            Self::AdditionsOnly => write!(f, "additions_only"),
            Self::Synthesized => write!(f, "synthesized"),
            Self::ThreeWay => write!(f, "three_way"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The two bodies to merge plus whatever context is known.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    pub local: &'a str,
    pub remote: &'a str,
    pub local_time: Option<DateTime<Utc>>,
    pub remote_time: Option<DateTime<Utc>>,
    /// Common-ancestor body, when one exists.
    pub base: Option<&'a str>,
}

impl<'a> MergeInput<'a> {
    pub fn new(local: &'a str, remote: &'a str) -> Self {
        Self {
            local,
            remote,
            local_time: None,
            remote_time: None,
            base: None,
        }
    }

    pub fn with_times(mut self, local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> Self {
        self.local_time = local;
        self.remote_time = remote;
        self
    }

    pub fn with_base(mut self, base: Option<&'a str>) -> Self {
        self.base = base;
        self
    }
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged { content: String, method: MergeMethod },
    /// The merger could not decide; the caller must ask for manual resolution.
    Conflict { reason: String },
}

impl MergeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    pub fn has_conflicts(&self) -> bool {
        !self.is_success()
    }

    pub fn merged(&self) -> Option<&str> {
        match self {
            Self::Merged { content, .. } => Some(content),
            Self::Conflict { .. } => None,
        }
    }
}

/// A strategy for merging two text bodies.
pub trait ContentMerger: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(&self, input: &MergeInput<'_>) -> MergeResult;
}

/// Build the merger selected by `strategy`.
pub fn merger_for(
    strategy: MergeStrategy,
    containment: ContainmentPolicy,
    max_changed_lines: usize,
) -> Box<dyn ContentMerger> {
    let heuristic = HeuristicMerger::new(containment, max_changed_lines);
    match strategy {
        MergeStrategy::Heuristic => Box::new(heuristic),
        MergeStrategy::ThreeWay => Box::new(ThreeWayMerger),
        MergeStrategy::ThreeWayThenHeuristic => Box::new(LayeredMerger::new(heuristic)),
    }
}

// ---------------------------------------------------------------------------
// Heuristic merger
// ---------------------------------------------------------------------------

/// Default cap on added+removed lines for a synthesized merge.
pub const DEFAULT_MAX_CHANGED_LINES: usize = 10;

/// Containment and line-diff heuristics, applied in order, first match wins:
///
/// 1. an empty or whitespace-only side yields the other side;
/// 2. identical text (after CRLF normalisation) is returned as-is;
/// 3. when one text contains the other, [`ContainmentPolicy`] decides;
/// 4. a diff with only insertions (or only deletions) keeps the longer text;
/// 5. a small diff with no delete-then-insert pair is stitched together,
///    keeping unchanged and inserted lines and dropping deleted ones;
/// 6. anything else is a conflict.
#[derive(Debug, Clone)]
pub struct HeuristicMerger {
    containment: ContainmentPolicy,
    max_changed_lines: usize,
}

impl Default for HeuristicMerger {
    fn default() -> Self {
        Self::new(ContainmentPolicy::default(), DEFAULT_MAX_CHANGED_LINES)
    }
}

impl HeuristicMerger {
    pub fn new(containment: ContainmentPolicy, max_changed_lines: usize) -> Self {
        Self {
            containment,
            max_changed_lines,
        }
    }

    fn containment(&self, input: &MergeInput<'_>, local: &str, remote: &str) -> Option<MergeResult> {
        let (superset, subset, subset_time, superset_time) = if local.len() > remote.len() && local.contains(remote) {
            (input.local, input.remote, input.remote_time, input.local_time)
        } else if remote.len() > local.len() && remote.contains(local) {
            (input.remote, input.local, input.local_time, input.remote_time)
        } else {
            return None;
        };

        let result = match self.containment {
            ContainmentPolicy::Manual => MergeResult::Conflict {
                reason: "one side contains the other and containment policy is manual".into(),
            },
            ContainmentPolicy::PreferSuperset => merged(superset, MergeMethod::Superset),
            ContainmentPolicy::TimestampIntent => match (subset_time, superset_time) {
                (Some(sub), Some(sup)) if sub > sup => merged(subset, MergeMethod::SubsetDeletion),
                _ => merged(superset, MergeMethod::Superset),
            },
        };
        Some(result)
    }

    fn line_merge(&self, input: &MergeInput<'_>, local: &str, remote: &str) -> MergeResult {
        let context = local.lines().count().max(remote.lines().count()) + 1;
        let patch = DiffOptions::new()
            .set_context_len(context)
            .create_patch(local, remote);

        let mut inserted = 0usize;
        let mut deleted = 0usize;
        let mut replace_pattern = false;
        let mut previous_was_delete = false;
        let mut synthesized = String::with_capacity(local.len().max(remote.len()));

        for hunk in patch.hunks() {
            for line in hunk.lines() {
                match line {
                    Line::Context(text) => {
                        synthesized.push_str(text);
                        previous_was_delete = false;
                    }
                    Line::Delete(_) => {
                        deleted += 1;
                        previous_was_delete = true;
                    }
                    Line::Insert(text) => {
                        inserted += 1;
                        if previous_was_delete {
                            replace_pattern = true;
                        }
                        synthesized.push_str(text);
                        previous_was_delete = false;
                    }
                }
            }
        }

        debug!(inserted, deleted, replace_pattern, "line diff computed");

        if deleted == 0 && inserted > 0 {
            return merged(input.remote, MergeMethod::AdditionsOnly);
        }
        if inserted == 0 && deleted > 0 {
            return merged(input.local, MergeMethod::AdditionsOnly);
        }

        if inserted + deleted <= self.max_changed_lines && !replace_pattern {
            return MergeResult::Merged {
                content: synthesized,
                method: MergeMethod::Synthesized,
            };
        }

        MergeResult::Conflict {
            reason: format!(
                "{} line(s) changed on overlapping regions (limit {})",
                inserted + deleted,
                self.max_changed_lines
            ),
        }
    }
}

impl ContentMerger for HeuristicMerger {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn merge(&self, input: &MergeInput<'_>) -> MergeResult {
        if input.local.trim().is_empty() {
            return merged(input.remote, MergeMethod::EmptySide);
        }
        if input.remote.trim().is_empty() {
            return merged(input.local, MergeMethod::EmptySide);
        }

        let local = normalize_line_endings(input.local);
        let remote = normalize_line_endings(input.remote);

        if local == remote {
            return merged(input.local, MergeMethod::Identical);
        }

        if let Some(result) = self.containment(input, &local, &remote) {
            debug!(policy = %self.containment, success = result.is_success(), "containment rule applied");
            return result;
        }

        self.line_merge(input, &local, &remote)
    }
}

// ---------------------------------------------------------------------------
// Three-way merger
// ---------------------------------------------------------------------------

/// Line-based three-way merge against the common ancestor using `diffy`.
///
/// Without an ancestor there is nothing to merge against and the result is a
/// conflict, except for the trivially identical case.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeWayMerger;

impl ContentMerger for ThreeWayMerger {
    fn name(&self) -> &'static str {
        "three_way"
    }

    fn merge(&self, input: &MergeInput<'_>) -> MergeResult {
        let local = normalize_line_endings(input.local);
        let remote = normalize_line_endings(input.remote);
        if local == remote {
            return merged(input.local, MergeMethod::Identical);
        }

        let Some(base) = input.base else {
            return MergeResult::Conflict {
                reason: "no common ancestor for a three-way merge".into(),
            };
        };
        let base = normalize_line_endings(base);

        match diffy::merge(&base, &local, &remote) {
            Ok(content) => MergeResult::Merged {
                content,
                method: MergeMethod::ThreeWay,
            },
            Err(with_markers) => {
                let regions = with_markers.matches("<<<<<<<").count();
                MergeResult::Conflict {
                    reason: format!("three-way merge left {regions} conflicting region(s)"),
                }
            }
        }
    }
}

/// Three-way first, then the heuristic when that fails or has no ancestor.
#[derive(Debug, Clone)]
pub struct LayeredMerger {
    fallback: HeuristicMerger,
}

impl LayeredMerger {
    pub fn new(fallback: HeuristicMerger) -> Self {
        Self { fallback }
    }
}

impl ContentMerger for LayeredMerger {
    fn name(&self) -> &'static str {
        "three_way_then_heuristic"
    }

    fn merge(&self, input: &MergeInput<'_>) -> MergeResult {
        match ThreeWayMerger.merge(input) {
            ok @ MergeResult::Merged { .. } => ok,
            MergeResult::Conflict { reason } => {
                debug!(%reason, "three-way merge failed, falling back to heuristic");
                self.fallback.merge(input)
            }
        }
    }
}

fn merged(content: &str, method: MergeMethod) -> MergeResult {
    MergeResult::Merged {
        content: content.to_string(),
        method,
    }
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}
