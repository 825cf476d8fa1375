#![forbid(unsafe_code)]

use crate::error::EngineError;
use crate::ids::{HierarchyTag, NodeId};
use crate::node_store::NodeStore;
use crate::report::{CycleDetected, Diagnostic};
use std::collections::{BTreeSet, HashSet};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleScan {
    pub cycles: Vec<CycleDetected>,
    pub dangling: Vec<Diagnostic>,
}

impl CycleScan {
    pub fn is_forest(&self) -> bool {
        self.cycles.is_empty()
    }
}

/// Walks every node's parent chain independently. A chain that reaches a
/// parent id missing from the snapshot ends there as if at a root; that is
/// reported as a dangling parent, not as a cycle. Each loop is reported once
/// no matter how many chains run into it.
pub fn detect_cycles(store: &NodeStore, tag: &HierarchyTag) -> CycleScan {
    let mut scan = CycleScan::default();
    let mut reported_cycles: HashSet<BTreeSet<NodeId>> = HashSet::new();
    let mut reported_dangling: HashSet<NodeId> = HashSet::new();

    for start in store.nodes_of(tag) {
        let mut path: Vec<NodeId> = vec![start.id.clone()];
        let mut visited: HashSet<NodeId> = HashSet::from([start.id.clone()]);
        let mut current = start;

        while let Some(parent_id) = current.parent_id.as_ref() {
            let parent = match store.get(parent_id) {
                Some(parent) if &parent.tag == tag => parent,
                _ => {
                    if reported_dangling.insert(current.id.clone()) {
                        scan.dangling.push(Diagnostic::DanglingParent {
                            tag: tag.clone(),
                            node_id: current.id.clone(),
                            parent_id: parent_id.clone(),
                        });
                    }
                    break;
                }
            };

            if !visited.insert(parent.id.clone()) {
                let loop_start = path
                    .iter()
                    .position(|id| id == &parent.id)
                    .unwrap_or_default();
                let members: Vec<NodeId> = path[loop_start..].to_vec();
                let key: BTreeSet<NodeId> = members.iter().cloned().collect();
                if reported_cycles.insert(key) {
                    scan.cycles.push(CycleDetected {
                        tag: tag.clone(),
                        start_node_id: start.id.clone(),
                        cycle_node_id: parent.id.clone(),
                        members,
                    });
                }
                break;
            }

            path.push(parent.id.clone());
            current = parent;
        }
    }

    scan
}

/// Validation gate run before any repair over `tag`: any cycle fails the
/// pass, dangling parents come back as diagnostics.
pub fn ensure_forest(store: &NodeStore, tag: &HierarchyTag) -> Result<Vec<Diagnostic>, EngineError> {
    let scan = detect_cycles(store, tag);
    for diagnostic in &scan.dangling {
        if let Diagnostic::DanglingParent {
            node_id, parent_id, ..
        } = diagnostic
        {
            tracing::warn!(tag = %tag, node = %node_id, parent = %parent_id, "dangling parent reference");
        }
    }
    if !scan.is_forest() {
        for cycle in &scan.cycles {
            tracing::error!(
                tag = %tag,
                start = %cycle.start_node_id,
                cycle_node = %cycle.cycle_node_id,
                length = cycle.members.len(),
                "parent cycle detected"
            );
        }
        return Err(EngineError::CycleDetected {
            tag: tag.clone(),
            cycles: scan.cycles,
        });
    }
    Ok(scan.dangling)
}
