#![forbid(unsafe_code)]

use crate::ids::{HierarchyTag, NodeId};
use serde::{Deserialize, Serialize};

/// One record of a parent-linked hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: NodeId,
    pub tag: HierarchyTag,
    pub name: String,
    pub parent_id: Option<NodeId>,
    pub code: Option<String>,
}

impl HierarchyNode {
    pub fn new(id: NodeId, tag: HierarchyTag, name: impl Into<String>) -> Self {
        Self {
            id,
            tag,
            name: name.into(),
            parent_id: None,
            code: None,
        }
    }

    pub fn with_parent(mut self, parent_id: NodeId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Position of a node among its siblings: either under the root sentinel or
/// under a concrete parent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKey {
    Root,
    Node(NodeId),
}

impl ParentKey {
    pub fn from_parent(parent_id: Option<&NodeId>) -> Self {
        match parent_id {
            Some(id) => Self::Node(id.clone()),
            None => Self::Root,
        }
    }

    pub fn as_parent_id(&self) -> Option<&NodeId> {
        match self {
            Self::Root => None,
            Self::Node(id) => Some(id),
        }
    }
}

/// An external pointer (a navigation link, a banner target) to a hierarchy
/// node, carried by label and by encoded target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub id: String,
    pub scope: String,
    pub label: String,
    pub target: String,
}

/// A node removed from one side of a mirror since the last pass. Its twin on
/// the other side becomes a deletion candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredNode {
    /// The removed node's id. Lets retired children find their twins
    /// through a parent retired in the same pass.
    #[serde(default)]
    pub id: Option<NodeId>,
    pub tag: HierarchyTag,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
}

/// Placeholder used when a name has no ASCII letters to build a code from.
pub const PLACEHOLDER_CODE: &str = "GEN";
const CODE_LEN: usize = 3;

/// Short code derived from a display name: ASCII letters only, first three,
/// uppercased.
pub fn derive_short_code(name: &str) -> String {
    let code: String = name
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(CODE_LEN)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if code.is_empty() {
        PLACEHOLDER_CODE.to_string()
    } else {
        code
    }
}

/// Label comparison key shared by twin matching and link repair.
pub fn label_key(label: &str) -> String {
    label.trim().to_lowercase()
}
