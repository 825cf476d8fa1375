#![forbid(unsafe_code)]

use crate::batch::{BatchOutcome, StagedBatch};
use crate::ids::{HierarchyTag, NodeId};
use crate::model::{CrossReference, HierarchyNode};

#[derive(Debug, thiserror::Error)]
pub enum BoundaryError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired { expires_at_ms: i64 },
    Held { holder: String, expires_at_ms: i64 },
}

/// Everything a reconciliation pass needs from persistence. Implementations
/// own their connection; the engine never keeps one beyond a pass.
pub trait HierarchyStore {
    fn fetch_all(&mut self, tag: &HierarchyTag) -> Result<Vec<HierarchyNode>, BoundaryError>;

    fn fetch_all_cross_references(
        &mut self,
        scope: &str,
    ) -> Result<Vec<CrossReference>, BoundaryError>;

    /// Records outside the hierarchies (products, listings) that point at the
    /// node and would be orphaned by deleting it.
    fn count_dependents(&mut self, node_id: &NodeId) -> Result<u64, BoundaryError>;

    fn apply_batch(&mut self, batch: &StagedBatch) -> Result<BatchOutcome, BoundaryError>;

    /// Claims the single-writer lease. An expired lease held by anyone counts
    /// as free; re-acquiring one's own lease renews it.
    fn acquire_pass_lock(&mut self, holder: &str, ttl_ms: u64)
    -> Result<LockOutcome, BoundaryError>;

    fn release_pass_lock(&mut self, holder: &str) -> Result<(), BoundaryError>;
}
