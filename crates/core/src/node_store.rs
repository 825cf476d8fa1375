#![forbid(unsafe_code)]

//! Read-only snapshot of one or more hierarchies, loaded at the start of a
//! pass. Writes never go through here; they are staged and applied as a
//! batch.

use crate::batch::NodeCreate;
use crate::boundary::HierarchyStore;
use crate::error::EngineError;
use crate::ids::{HierarchyTag, NodeId};
use crate::model::{HierarchyNode, ParentKey, label_key};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

type TwinKey = (HierarchyTag, String, ParentKey);

#[derive(Clone, Debug, Default)]
pub struct NodeStore {
    nodes: HashMap<NodeId, HierarchyNode>,
    by_tag: BTreeMap<HierarchyTag, Vec<NodeId>>,
    // Names are not unique, so one key can hold several ids.
    by_twin_key: HashMap<TwinKey, Vec<NodeId>>,
}

impl NodeStore {
    /// Loads every listed hierarchy or fails; a partially loaded snapshot is
    /// never returned.
    pub fn load<S>(store: &mut S, tags: &[HierarchyTag]) -> Result<Self, EngineError>
    where
        S: HierarchyStore + ?Sized,
    {
        let mut nodes = Vec::new();
        let mut loaded = HashSet::new();
        for tag in tags {
            if !loaded.insert(tag.clone()) {
                continue;
            }
            let fetched = store.fetch_all(tag)?;
            tracing::debug!(tag = %tag, count = fetched.len(), "hierarchy loaded");
            nodes.extend(fetched.into_iter().filter(|node| &node.tag == tag));
        }
        let mut snapshot = Self::from_nodes(nodes);
        for tag in loaded {
            snapshot.by_tag.entry(tag).or_default();
        }
        Ok(snapshot)
    }

    /// Later duplicates of an id replace earlier ones.
    pub fn from_nodes(nodes: impl IntoIterator<Item = HierarchyNode>) -> Self {
        let mut by_id: HashMap<NodeId, HierarchyNode> = HashMap::new();
        for node in nodes {
            by_id.insert(node.id.clone(), node);
        }

        let mut by_tag: BTreeMap<HierarchyTag, Vec<NodeId>> = BTreeMap::new();
        let mut by_twin_key: HashMap<TwinKey, Vec<NodeId>> = HashMap::new();
        let mut ordered: Vec<&HierarchyNode> = by_id.values().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        for node in ordered {
            by_tag.entry(node.tag.clone()).or_default().push(node.id.clone());
            by_twin_key
                .entry(twin_key_of(node))
                .or_default()
                .push(node.id.clone());
        }

        Self {
            nodes: by_id,
            by_tag,
            by_twin_key,
        }
    }

    /// A copy of this snapshot with staged creates added, used to plan
    /// against the state the batch will produce.
    pub fn with_creates(&self, creates: &[NodeCreate]) -> Self {
        if creates.is_empty() {
            return self.clone();
        }
        let staged = creates.iter().map(|create| HierarchyNode {
            id: create.id.clone(),
            tag: create.tag.clone(),
            name: create.name.clone(),
            parent_id: create.parent_id.clone(),
            code: create.code.clone(),
        });
        let mut view = Self::from_nodes(self.nodes.values().cloned().chain(staged));
        for tag in self.by_tag.keys() {
            view.by_tag.entry(tag.clone()).or_default();
        }
        view
    }

    pub fn get(&self, id: &NodeId) -> Option<&HierarchyNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = &HierarchyTag> {
        self.by_tag.keys()
    }

    /// Nodes of one hierarchy, ordered by id.
    pub fn nodes_of<'a>(
        &'a self,
        tag: &HierarchyTag,
    ) -> impl Iterator<Item = &'a HierarchyNode> + use<'a> {
        self.by_tag
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    /// The node with this name under this parent, if exactly one exists.
    /// With duplicates the lowest id wins, so matching stays deterministic.
    pub fn find_twin(
        &self,
        tag: &HierarchyTag,
        name: &str,
        parent: &ParentKey,
    ) -> Option<&HierarchyNode> {
        self.by_twin_key
            .get(&(tag.clone(), label_key(name), parent.clone()))
            .and_then(|ids| ids.first())
            .and_then(|id| self.nodes.get(id))
    }

    /// Children of every parent (and of the root sentinel), ordered by name
    /// then id. Parents that are not loaded still get an entry.
    pub fn index_by_parent(&self, tag: &HierarchyTag) -> BTreeMap<ParentKey, Vec<NodeId>> {
        let mut index: BTreeMap<ParentKey, Vec<&HierarchyNode>> = BTreeMap::new();
        for node in self.nodes_of(tag) {
            index
                .entry(ParentKey::from_parent(node.parent_id.as_ref()))
                .or_default()
                .push(node);
        }
        index
            .into_iter()
            .map(|(parent, mut children)| {
                children.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
                (parent, children.into_iter().map(|n| n.id.clone()).collect())
            })
            .collect()
    }

    pub fn children_of(&self, tag: &HierarchyTag, parent: &ParentKey) -> Vec<&HierarchyNode> {
        let mut children: Vec<&HierarchyNode> = self
            .nodes_of(tag)
            .filter(|node| ParentKey::from_parent(node.parent_id.as_ref()) == *parent)
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// Breadth-first ids below `anchor` (excluding the anchor itself), or the
    /// whole hierarchy from its roots when `anchor` is `None`. Parents always
    /// precede their children. Nodes whose parent is not loaded count as
    /// roots of the whole-hierarchy walk. Must only be called on an acyclic
    /// hierarchy; a node is never yielded twice regardless.
    pub fn subtree(&self, tag: &HierarchyTag, anchor: Option<&NodeId>) -> Vec<NodeId> {
        let index = self.index_by_parent(tag);
        let mut queue: VecDeque<NodeId> = VecDeque::new();

        match anchor {
            Some(anchor) => {
                if let Some(children) = index.get(&ParentKey::Node(anchor.clone())) {
                    queue.extend(children.iter().cloned());
                }
            }
            None => {
                if let Some(roots) = index.get(&ParentKey::Root) {
                    queue.extend(roots.iter().cloned());
                }
                for (parent, children) in index.iter() {
                    if let ParentKey::Node(parent_id) = parent
                        && !self.get(parent_id).is_some_and(|p| &p.tag == tag)
                    {
                        queue.extend(children.iter().cloned());
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(children) = index.get(&ParentKey::Node(id.clone())) {
                queue.extend(children.iter().cloned());
            }
            out.push(id);
        }
        out
    }
}

fn twin_key_of(node: &HierarchyNode) -> TwinKey {
    (
        node.tag.clone(),
        label_key(&node.name),
        ParentKey::from_parent(node.parent_id.as_ref()),
    )
}
