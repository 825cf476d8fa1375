#![forbid(unsafe_code)]

use crate::ids::{HierarchyTag, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCreate {
    pub id: NodeId,
    pub tag: HierarchyTag,
    pub name: String,
    pub parent_id: Option<NodeId>,
    pub code: Option<String>,
    /// The node on the other side of the mirror this create answers.
    pub twin_of: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceUpdate {
    pub reference_id: String,
    pub scope: String,
    pub label: String,
    pub previous_target: String,
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDelete {
    pub id: NodeId,
    pub tag: HierarchyTag,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
}

/// One staged write, used when a batch must be reported op by op.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StagedOp {
    Create(NodeCreate),
    Update(ReferenceUpdate),
    Delete(NodeDelete),
}

impl StagedOp {
    pub fn describe(&self) -> String {
        match self {
            Self::Create(op) => format!("create {}:{} ({})", op.tag, op.id, op.name),
            Self::Update(op) => format!("update {}:{} -> {}", op.scope, op.reference_id, op.target),
            Self::Delete(op) => format!("delete {}:{} ({})", op.tag, op.id, op.name),
        }
    }
}

/// Writes computed by one pass, committed together at the end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedBatch {
    pub creates: Vec<NodeCreate>,
    pub updates: Vec<ReferenceUpdate>,
    pub deletes: Vec<NodeDelete>,
}

impl StagedBatch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Ops in application order: creates (parents first, as staged), then
    /// updates, then deletes with children before their parents.
    pub fn ordered_ops(&self) -> Vec<StagedOp> {
        let mut ops = Vec::with_capacity(self.len());
        ops.extend(self.creates.iter().cloned().map(StagedOp::Create));
        ops.extend(self.updates.iter().cloned().map(StagedOp::Update));
        ops.extend(self.deletes_children_first().into_iter().map(StagedOp::Delete));
        ops
    }

    /// Deletes ordered by how many of their ancestors are deleted too,
    /// deepest first. Ties keep staged order.
    fn deletes_children_first(&self) -> Vec<NodeDelete> {
        let parents: HashMap<&NodeId, Option<&NodeId>> = self
            .deletes
            .iter()
            .map(|delete| (&delete.id, delete.parent_id.as_ref()))
            .collect();
        let depth = |delete: &NodeDelete| {
            let mut depth = 0usize;
            let mut current = delete.parent_id.as_ref();
            while let Some(parent) = current {
                let Some(next) = parents.get(parent) else {
                    break;
                };
                depth += 1;
                if depth > parents.len() {
                    break;
                }
                current = *next;
            }
            depth
        };
        let mut deletes = self.deletes.clone();
        deletes.sort_by_key(|delete| std::cmp::Reverse(depth(delete)));
        deletes
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            created: self.creates.len(),
            updated: self.updates.len(),
            deleted: self.deletes.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied(BatchSummary),
    /// Only non-transactional stores produce this: `applied` are durable,
    /// `pending` were never attempted or failed.
    PartialFailure {
        applied: Vec<StagedOp>,
        pending: Vec<StagedOp>,
        message: String,
    },
}
