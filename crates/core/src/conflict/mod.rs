//! Change detection, conflict classification, content merging and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Analysis** -- diffing a snapshot against the shared baseline.
//! 2. **Classification** -- finding paths both sides changed incompatibly.
//! 3. **Merging** -- automatic text merges behind [`ContentMerger`].
//! 4. **Resolution** -- settling conflicts or flagging them for a decision.

pub mod analyzer;
pub mod classifier;
pub mod merger;
pub mod reconciler;
pub mod resolver;

pub use analyzer::{ChangeAnalyzer, ChangeSet, Modification, PathChange};
pub use classifier::{Conflict, ConflictClassifier, ConflictType};
pub use merger::{
    merger_for, ContainmentPolicy, ContentMerger, HeuristicMerger, LayeredMerger, MergeInput,
    MergeMethod, MergeResult, MergeStrategy, ThreeWayMerger,
};
pub use reconciler::{Reconciler, Reconciliation, ResolvedConflict};
pub use resolver::{ConflictResolver, Resolution, ResolutionRule};
