#![forbid(unsafe_code)]

//! In-memory persistence, used by tests and dry runs. It can behave as a
//! non-transactional store and inject failures part way through a batch.

use crate::batch::{BatchOutcome, StagedBatch, StagedOp};
use crate::boundary::{BoundaryError, HierarchyStore, LockOutcome};
use crate::ids::{HierarchyTag, NodeId};
use crate::model::{CrossReference, HierarchyNode};
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug)]
struct Lease {
    holder: String,
    expires_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct MemoryStore {
    nodes: BTreeMap<NodeId, HierarchyNode>,
    references: BTreeMap<String, CrossReference>,
    dependents: HashMap<NodeId, u64>,
    lease: Option<Lease>,
    now_ms: i64,
    transactional: bool,
    fail_after: Option<usize>,
    unavailable: bool,
    writes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            references: BTreeMap::new(),
            dependents: HashMap::new(),
            lease: None,
            now_ms: 0,
            transactional: true,
            fail_after: None,
            unavailable: false,
            writes: 0,
        }
    }
}

impl MemoryStore {
    pub fn non_transactional() -> Self {
        Self {
            transactional: false,
            ..Self::default()
        }
    }

    pub fn insert_node(&mut self, node: HierarchyNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Option<HierarchyNode> {
        self.nodes.remove(id)
    }

    pub fn insert_reference(&mut self, reference: CrossReference) {
        self.references.insert(reference.id.clone(), reference);
    }

    pub fn set_dependents(&mut self, id: &NodeId, count: u64) {
        self.dependents.insert(id.clone(), count);
    }

    pub fn set_now_ms(&mut self, now_ms: i64) {
        self.now_ms = now_ms;
    }

    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    /// The next batch fails after `ops` operations. One-shot.
    pub fn fail_next_batch_after(&mut self, ops: usize) {
        self.fail_after = Some(ops);
    }

    pub fn node(&self, id: &NodeId) -> Option<&HierarchyNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &HierarchyNode> {
        self.nodes.values()
    }

    pub fn reference(&self, id: &str) -> Option<&CrossReference> {
        self.references.get(id)
    }

    pub fn lock_holder(&self) -> Option<&str> {
        self.lease.as_ref().map(|lease| lease.holder.as_str())
    }

    /// Records actually changed by applied batches.
    pub fn writes(&self) -> usize {
        self.writes
    }

    fn check_available(&self) -> Result<(), BoundaryError> {
        if self.unavailable {
            return Err(BoundaryError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn apply_op(&mut self, op: &StagedOp) {
        match op {
            StagedOp::Create(create) => {
                if self.nodes.contains_key(&create.id) {
                    return;
                }
                let mut node = HierarchyNode::new(create.id.clone(), create.tag.clone(), &create.name);
                node.parent_id = create.parent_id.clone();
                node.code = create.code.clone();
                self.nodes.insert(create.id.clone(), node);
                self.writes += 1;
            }
            StagedOp::Update(update) => {
                if let Some(reference) = self.references.get_mut(&update.reference_id)
                    && reference.target != update.target
                {
                    reference.target = update.target.clone();
                    self.writes += 1;
                }
            }
            StagedOp::Delete(delete) => {
                if self.nodes.remove(&delete.id).is_some() {
                    self.writes += 1;
                }
            }
        }
    }
}

impl HierarchyStore for MemoryStore {
    fn fetch_all(&mut self, tag: &HierarchyTag) -> Result<Vec<HierarchyNode>, BoundaryError> {
        self.check_available()?;
        Ok(self
            .nodes
            .values()
            .filter(|node| &node.tag == tag)
            .cloned()
            .collect())
    }

    fn fetch_all_cross_references(
        &mut self,
        scope: &str,
    ) -> Result<Vec<CrossReference>, BoundaryError> {
        self.check_available()?;
        Ok(self
            .references
            .values()
            .filter(|reference| reference.scope == scope)
            .cloned()
            .collect())
    }

    fn count_dependents(&mut self, node_id: &NodeId) -> Result<u64, BoundaryError> {
        self.check_available()?;
        Ok(self.dependents.get(node_id).copied().unwrap_or(0))
    }

    fn apply_batch(&mut self, batch: &StagedBatch) -> Result<BatchOutcome, BoundaryError> {
        self.check_available()?;
        let ops = batch.ordered_ops();
        let fail_at = self.fail_after.take().filter(|at| *at < ops.len());

        if self.transactional {
            if fail_at.is_some() {
                return Err(BoundaryError::Unavailable(
                    "injected failure; batch rolled back".to_string(),
                ));
            }
            for op in &ops {
                self.apply_op(op);
            }
            return Ok(BatchOutcome::Applied(batch.summary()));
        }

        for (index, op) in ops.iter().enumerate() {
            if fail_at == Some(index) {
                return Ok(BatchOutcome::PartialFailure {
                    applied: ops[..index].to_vec(),
                    pending: ops[index..].to_vec(),
                    message: format!("injected failure at op {index}"),
                });
            }
            self.apply_op(op);
        }
        Ok(BatchOutcome::Applied(batch.summary()))
    }

    fn acquire_pass_lock(
        &mut self,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<LockOutcome, BoundaryError> {
        self.check_available()?;
        if let Some(lease) = self.lease.as_ref()
            && lease.holder != holder
            && lease.expires_at_ms > self.now_ms
        {
            return Ok(LockOutcome::Held {
                holder: lease.holder.clone(),
                expires_at_ms: lease.expires_at_ms,
            });
        }
        let expires_at_ms = self
            .now_ms
            .saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX));
        self.lease = Some(Lease {
            holder: holder.to_string(),
            expires_at_ms,
        });
        Ok(LockOutcome::Acquired { expires_at_ms })
    }

    fn release_pass_lock(&mut self, holder: &str) -> Result<(), BoundaryError> {
        if self
            .lease
            .as_ref()
            .is_some_and(|lease| lease.holder == holder)
        {
            self.lease = None;
        }
        Ok(())
    }
}
