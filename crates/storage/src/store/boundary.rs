#![forbid(unsafe_code)]

use super::locks::ensure_lease_tx;
use super::nodes::{node_create_tx, node_delete_tx};
use super::references::reference_update_tx;
use super::*;
use tk_core::{
    BatchOutcome, BoundaryError, CrossReference, HierarchyNode, HierarchyStore, HierarchyTag,
    LockOutcome, NodeId, StagedBatch, StagedOp,
};

fn unavailable(err: StoreError) -> BoundaryError {
    BoundaryError::Unavailable(err.to_string())
}

impl HierarchyStore for SqliteStore {
    fn fetch_all(&mut self, tag: &HierarchyTag) -> Result<Vec<HierarchyNode>, BoundaryError> {
        self.nodes_list(tag).map_err(unavailable)
    }

    fn fetch_all_cross_references(
        &mut self,
        scope: &str,
    ) -> Result<Vec<CrossReference>, BoundaryError> {
        self.references_list(scope).map_err(unavailable)
    }

    fn count_dependents(&mut self, node_id: &NodeId) -> Result<u64, BoundaryError> {
        self.dependents_count(node_id).map_err(unavailable)
    }

    /// All-or-nothing: any failing statement rolls the whole batch back, so
    /// this store never reports a partial failure. The batch only commits
    /// while this handle holds the pass lease.
    fn apply_batch(&mut self, batch: &StagedBatch) -> Result<BatchOutcome, BoundaryError> {
        self.apply_batch_tx(batch).map_err(|err| {
            tracing::error!(error = %err, ops = batch.len(), "batch rolled back");
            unavailable(err)
        })
    }

    fn acquire_pass_lock(
        &mut self,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<LockOutcome, BoundaryError> {
        self.pass_lock_acquire(holder, ttl_ms).map_err(unavailable)
    }

    fn release_pass_lock(&mut self, holder: &str) -> Result<(), BoundaryError> {
        self.pass_lock_release(holder).map(|_| ()).map_err(unavailable)
    }
}

impl SqliteStore {
    fn apply_batch_tx(&mut self, batch: &StagedBatch) -> Result<BatchOutcome, StoreError> {
        let now_ms = self.now_ms();
        let tx = self.conn.transaction()?;
        ensure_lease_tx(&tx, &self.session, now_ms)?;
        let mut written = 0usize;
        for op in batch.ordered_ops() {
            let changed = match &op {
                StagedOp::Create(create) => node_create_tx(&tx, create, now_ms)?,
                StagedOp::Update(update) => reference_update_tx(&tx, update, now_ms)?,
                StagedOp::Delete(delete) => node_delete_tx(&tx, &delete.id)?,
            };
            if changed {
                written += 1;
            } else {
                tracing::debug!(op = %op.describe(), "op already applied");
            }
        }
        tx.commit()?;
        tracing::debug!(ops = batch.len(), written, "batch committed");
        Ok(BatchOutcome::Applied(batch.summary()))
    }
}
