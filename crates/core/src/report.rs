#![forbid(unsafe_code)]

use crate::batch::{BatchSummary, StagedBatch};
use crate::ids::{HierarchyTag, NodeId};
use serde::{Deserialize, Serialize};

/// A structural loop found by the cycle detector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleDetected {
    pub tag: HierarchyTag,
    pub start_node_id: NodeId,
    pub cycle_node_id: NodeId,
    /// Nodes on the loop, in parent-walk order starting at `cycle_node_id`.
    pub members: Vec<NodeId>,
}

/// Non-fatal findings collected into the pass report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    DanglingParent {
        tag: HierarchyTag,
        node_id: NodeId,
        parent_id: NodeId,
    },
    DeletionBlocked {
        tag: HierarchyTag,
        node_id: NodeId,
        name: String,
        reason: String,
    },
    UnresolvedReference {
        scope: String,
        reference_id: String,
        label: String,
        reason: String,
    },
    /// A stage that did not run because a hierarchy it reads has a cycle.
    StageSkipped {
        stage: String,
        tag: HierarchyTag,
        cycles: Vec<CycleDetected>,
    },
    /// A retired node whose twin could not be located.
    RetirementUnresolved {
        tag: HierarchyTag,
        name: String,
        reason: String,
    },
}

impl Diagnostic {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DanglingParent { .. } => "DANGLING_PARENT",
            Self::DeletionBlocked { .. } => "DELETION_BLOCKED",
            Self::UnresolvedReference { .. } => "UNRESOLVED_REFERENCE",
            Self::StageSkipped { .. } => "STAGE_SKIPPED",
            Self::RetirementUnresolved { .. } => "RETIREMENT_UNRESOLVED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub job: String,
    pub dry_run: bool,
    pub staged: BatchSummary,
    pub applied: bool,
    pub batch: StagedBatch,
    pub diagnostics: Vec<Diagnostic>,
}

impl PassReport {
    pub fn diagnostics_of(&self, code: &str) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.code() == code)
    }
}
