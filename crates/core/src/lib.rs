#![forbid(unsafe_code)]

//! Tree consistency engine for parent-linked hierarchies: cycle detection,
//! mirror reconciliation between two hierarchies, and cross-reference repair,
//! all staged into one batch per pass.

pub mod batch;
pub mod boundary;
pub mod cycles;
pub mod engine;
pub mod error;
pub mod ids;
pub mod links;
pub mod memory;
pub mod mirror;
pub mod model;
pub mod node_store;
pub mod report;

pub use batch::{
    BatchOutcome, BatchSummary, NodeCreate, NodeDelete, ReferenceUpdate, StagedBatch, StagedOp,
};
pub use boundary::{BoundaryError, HierarchyStore, LockOutcome};
pub use cycles::{CycleScan, detect_cycles, ensure_forest};
pub use engine::{CancelToken, PassGuard, PassOptions, RepairJob, run_pass};
pub use error::EngineError;
pub use ids::{HierarchyTag, HierarchyTagError, NodeId, NodeIdError};
pub use links::{LinkPlan, LinkRule, StaticTarget, TargetView, plan_links};
pub use memory::MemoryStore;
pub use mirror::{MirrorPlan, MirrorRule, MirrorSide, plan_mirror};
pub use model::{CrossReference, HierarchyNode, ParentKey, RetiredNode, derive_short_code};
pub use node_store::NodeStore;
pub use report::{CycleDetected, Diagnostic, PassReport};
