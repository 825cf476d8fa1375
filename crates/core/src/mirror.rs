#![forbid(unsafe_code)]

//! Bidirectional existence between two hierarchies: every in-scope node on
//! one side has a node with the same name under the mirrored parent on the
//! other side.

use crate::batch::{NodeCreate, NodeDelete};
use crate::error::EngineError;
use crate::ids::{HierarchyTag, MAX_NODE_ID_LEN, NodeId};
use crate::model::{HierarchyNode, ParentKey, RetiredNode, derive_short_code, label_key};
use crate::node_store::NodeStore;
use crate::report::Diagnostic;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

const MAX_ID_SUFFIX: usize = 1_000;
/// Room kept for the largest `-N` suffix.
const ID_SUFFIX_RESERVE: usize = 5;
/// Bytes of the source id digest used when a derived id must be shortened.
const ID_DIGEST_BYTES: usize = 6;
const MAX_ROUNDS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSide {
    pub tag: HierarchyTag,
    /// Node under which this side's mirrored subtree lives. `None` puts the
    /// whole hierarchy in scope, its roots being the mirror roots.
    #[serde(default)]
    pub anchor: Option<NodeId>,
    /// Whether nodes created on this side get a short code.
    #[serde(default)]
    pub derive_code: bool,
}

impl MirrorSide {
    fn root_key(&self) -> ParentKey {
        ParentKey::from_parent(self.anchor.as_ref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRule {
    pub left: MirrorSide,
    pub right: MirrorSide,
}

impl MirrorRule {
    pub fn tags(&self) -> [&HierarchyTag; 2] {
        [&self.left.tag, &self.right.tag]
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.left.tag == self.right.tag {
            return Err(EngineError::InvalidRule(
                "mirror sides must name different hierarchies",
            ));
        }
        Ok(())
    }

    fn side_of(&self, tag: &HierarchyTag) -> Option<(&MirrorSide, &MirrorSide)> {
        if tag == &self.left.tag {
            Some((&self.left, &self.right))
        } else if tag == &self.right.tag {
            Some((&self.right, &self.left))
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorPlan {
    pub creates: Vec<NodeCreate>,
    pub deletes: Vec<NodeDelete>,
    pub diagnostics: Vec<Diagnostic>,
}

impl MirrorPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

/// Computes the creates and deletes that bring both sides back into step.
///
/// Deletions are decided first, deepest twins first: the twin of every
/// retired node is deleted only when nothing depends on it and every child
/// it has is going too. Neither a twin staged for deletion nor a retired node
/// is recreated in the same pass.
/// `count_dependents` is only consulted for deletion candidates.
pub fn plan_mirror<F>(
    store: &NodeStore,
    rule: &MirrorRule,
    retired: &[RetiredNode],
    mut count_dependents: F,
) -> Result<MirrorPlan, EngineError>
where
    F: FnMut(&NodeId) -> Result<u64, EngineError>,
{
    rule.validate()?;
    for side in [&rule.left, &rule.right] {
        if let Some(anchor) = side.anchor.as_ref() {
            match store.get(anchor) {
                Some(node) if node.tag == side.tag => {}
                _ => return Err(EngineError::InvalidRule("mirror anchor is not loaded")),
            }
        }
    }

    let mut plan = MirrorPlan::default();
    let mut doomed: HashSet<NodeId> = HashSet::new();
    let mut retired_keys: HashSet<(HierarchyTag, String, ParentKey)> = HashSet::new();
    let ghosts = Ghosts::new(retired);

    let mut candidates: Vec<(usize, &HierarchyNode)> = Vec::new();
    for node in retired {
        let Some((side, other)) = rule.side_of(&node.tag) else {
            tracing::warn!(tag = %node.tag, name = %node.name, "retired node outside mirror rule; ignored");
            continue;
        };
        retired_keys.insert((
            node.tag.clone(),
            label_key(&node.name),
            ParentKey::from_parent(node.parent_id.as_ref()),
        ));
        if let Some(twin) = locate_retired_twin(store, &ghosts, side, other, node, &mut plan) {
            candidates.push((depth_of(store, twin), twin));
        }
    }

    // Deepest twins first, so a parent sees which of its children are
    // already going.
    candidates.sort_by(|(a_depth, a), (b_depth, b)| b_depth.cmp(a_depth).then(a.id.cmp(&b.id)));
    for (_, twin) in candidates {
        let Some((other, side)) = rule.side_of(&twin.tag) else {
            continue;
        };
        plan_retirement(
            store,
            &ghosts,
            side,
            other,
            twin,
            &mut count_dependents,
            &mut doomed,
            &mut plan,
        )?;
    }

    // Alternate directions over a view that includes staged creates until a
    // round adds nothing. Duplicate sibling names on one side can otherwise
    // leave work for the next pass.
    let mut staged_ids: HashSet<NodeId> = HashSet::new();
    let mut settled = false;
    for _ in 0..MAX_ROUNDS {
        let before = plan.creates.len();
        for (from, to) in [(&rule.left, &rule.right), (&rule.right, &rule.left)] {
            let view = store.with_creates(&plan.creates);
            mirror_direction(
                &view,
                from,
                to,
                &doomed,
                &retired_keys,
                &mut staged_ids,
                &mut plan,
            )?;
        }
        if plan.creates.len() == before {
            settled = true;
            break;
        }
    }
    if !settled {
        tracing::warn!(
            left = %rule.left.tag,
            right = %rule.right.tag,
            "mirror plan did not settle; the next pass continues"
        );
    }

    tracing::debug!(
        left = %rule.left.tag,
        right = %rule.right.tag,
        creates = plan.creates.len(),
        deletes = plan.deletes.len(),
        "mirror plan computed"
    );
    Ok(plan)
}

/// Retired nodes that carry an id, so parent walks can pass through them.
struct Ghosts<'a> {
    by_id: HashMap<&'a NodeId, &'a RetiredNode>,
}

impl<'a> Ghosts<'a> {
    fn new(retired: &'a [RetiredNode]) -> Self {
        let by_id = retired
            .iter()
            .filter_map(|node| node.id.as_ref().map(|id| (id, node)))
            .collect();
        Self { by_id }
    }

    fn get(&self, tag: &HierarchyTag, id: &NodeId) -> Option<&'a RetiredNode> {
        self.by_id.get(id).copied().filter(|node| &node.tag == tag)
    }
}

/// The existing twin of a retired node, or `None` after recording why there
/// is nothing to delete.
fn locate_retired_twin<'s>(
    store: &'s NodeStore,
    ghosts: &Ghosts<'_>,
    side: &MirrorSide,
    other: &MirrorSide,
    retired: &RetiredNode,
    plan: &mut MirrorPlan,
) -> Option<&'s HierarchyNode> {
    let source_key = ParentKey::from_parent(retired.parent_id.as_ref());
    if let Some(still_there) = store.find_twin(&side.tag, &retired.name, &source_key) {
        plan.diagnostics.push(blocked(still_there, "source still present"));
        return None;
    }

    let Some(mapped_parent) = map_parent_key(store, ghosts, side, other, &source_key) else {
        tracing::warn!(tag = %retired.tag, name = %retired.name, "retired node has no mirrored parent");
        plan.diagnostics.push(Diagnostic::RetirementUnresolved {
            tag: retired.tag.clone(),
            name: retired.name.clone(),
            reason: "no mirrored parent".to_string(),
        });
        return None;
    };
    // Missing twin: already gone, re-deleting is a no-op.
    store.find_twin(&other.tag, &retired.name, &mapped_parent)
}

fn depth_of(store: &NodeStore, node: &HierarchyNode) -> usize {
    let mut depth = 0;
    let mut seen = HashSet::new();
    let mut current = node.parent_id.as_ref();
    while let Some(id) = current {
        if !seen.insert(id) {
            break;
        }
        depth += 1;
        current = store.get(id).and_then(|parent| parent.parent_id.as_ref());
    }
    depth
}

#[allow(clippy::too_many_arguments)]
fn plan_retirement<F>(
    store: &NodeStore,
    ghosts: &Ghosts<'_>,
    side: &MirrorSide,
    other: &MirrorSide,
    twin: &HierarchyNode,
    count_dependents: &mut F,
    doomed: &mut HashSet<NodeId>,
    plan: &mut MirrorPlan,
) -> Result<(), EngineError>
where
    F: FnMut(&NodeId) -> Result<u64, EngineError>,
{
    if doomed.contains(&twin.id) {
        return Ok(());
    }

    // Another live node may still map onto the same twin.
    let twin_parent = ParentKey::from_parent(twin.parent_id.as_ref());
    if let Some(back) = map_parent_key(store, ghosts, other, side, &twin_parent)
        && store.find_twin(&side.tag, &twin.name, &back).is_some()
    {
        plan.diagnostics.push(blocked(twin, "still mirrored"));
        return Ok(());
    }

    if store
        .children_of(&other.tag, &ParentKey::Node(twin.id.clone()))
        .iter()
        .any(|child| !doomed.contains(&child.id))
    {
        plan.diagnostics.push(blocked(twin, "has children"));
        return Ok(());
    }
    let dependents = count_dependents(&twin.id)?;
    if dependents > 0 {
        tracing::warn!(tag = %twin.tag, node = %twin.id, dependents, "mirror deletion blocked");
        plan.diagnostics.push(blocked(twin, "has dependents"));
        return Ok(());
    }

    doomed.insert(twin.id.clone());
    plan.deletes.push(NodeDelete {
        id: twin.id.clone(),
        tag: twin.tag.clone(),
        name: twin.name.clone(),
        parent_id: twin.parent_id.clone(),
    });
    Ok(())
}

fn blocked(node: &HierarchyNode, reason: &str) -> Diagnostic {
    Diagnostic::DeletionBlocked {
        tag: node.tag.clone(),
        node_id: node.id.clone(),
        name: node.name.clone(),
        reason: reason.to_string(),
    }
}

/// Maps a parent position on `from` to the matching position on `to` by
/// walking up to `from`'s mirror root and back down by name. The walk passes
/// through retired nodes. `None` when the position is outside `from`'s scope
/// or a twin is missing along the way.
fn map_parent_key<'a>(
    store: &'a NodeStore,
    ghosts: &Ghosts<'a>,
    from: &MirrorSide,
    to: &MirrorSide,
    parent: &ParentKey,
) -> Option<ParentKey> {
    let mut names: Vec<&str> = Vec::new();
    let mut current = parent.clone();
    let mut seen = HashSet::new();
    loop {
        if current == from.root_key() {
            break;
        }
        let ParentKey::Node(id) = &current else {
            return None;
        };
        if !seen.insert(id.clone()) {
            return None;
        }
        let (name, parent_id) = match store.get(id) {
            Some(node) => (node.name.as_str(), node.parent_id.as_ref()),
            None => {
                let ghost = ghosts.get(&from.tag, id)?;
                (ghost.name.as_str(), ghost.parent_id.as_ref())
            }
        };
        names.push(name);
        current = ParentKey::from_parent(parent_id);
    }

    let mut mapped = to.root_key();
    for name in names.into_iter().rev() {
        let twin = store.find_twin(&to.tag, name, &mapped)?;
        mapped = ParentKey::Node(twin.id.clone());
    }
    Some(mapped)
}

fn mirror_direction(
    store: &NodeStore,
    from: &MirrorSide,
    to: &MirrorSide,
    doomed: &HashSet<NodeId>,
    retired_keys: &HashSet<(HierarchyTag, String, ParentKey)>,
    staged_ids: &mut HashSet<NodeId>,
    plan: &mut MirrorPlan,
) -> Result<(), EngineError> {
    let mut twin_of: HashMap<NodeId, NodeId> = HashMap::new();
    let mut staged_twins: HashMap<(String, ParentKey), NodeId> = HashMap::new();

    for id in store.subtree(&from.tag, from.anchor.as_ref()) {
        let Some(node) = store.get(&id) else {
            continue;
        };
        if doomed.contains(&node.id) {
            continue;
        }

        let parent_key = ParentKey::from_parent(node.parent_id.as_ref());
        let mapped_parent = if parent_key == from.root_key() {
            to.root_key()
        } else {
            match node.parent_id.as_ref().and_then(|p| twin_of.get(p)) {
                Some(parent_twin) => ParentKey::Node(parent_twin.clone()),
                // Parent was skipped or dangles: nothing to hang a twin on.
                None => continue,
            }
        };

        let name_key = label_key(&node.name);
        if let Some(existing) = store.find_twin(&to.tag, &node.name, &mapped_parent)
            && !doomed.contains(&existing.id)
        {
            twin_of.insert(node.id.clone(), existing.id.clone());
            continue;
        }
        if let Some(staged) = staged_twins.get(&(name_key.clone(), mapped_parent.clone())) {
            twin_of.insert(node.id.clone(), staged.clone());
            continue;
        }
        if retired_keys.contains(&(to.tag.clone(), name_key.clone(), mapped_parent.clone())) {
            continue;
        }

        let create_id = derive_create_id(store, staged_ids, &to.tag, &node.id)?;
        let create = NodeCreate {
            id: create_id.clone(),
            tag: to.tag.clone(),
            name: node.name.clone(),
            parent_id: mapped_parent.as_parent_id().cloned(),
            code: to.derive_code.then(|| derive_short_code(&node.name)),
            twin_of: node.id.clone(),
        };
        tracing::debug!(tag = %create.tag, id = %create.id, name = %create.name, "mirror create staged");
        staged_twins.insert((name_key, mapped_parent), create_id.clone());
        twin_of.insert(node.id.clone(), create_id);
        plan.creates.push(create);
    }
    Ok(())
}

/// `<tag>-<source id>`, or a truncated prefix plus a digest of the source id
/// when that would not fit a node id with its suffix.
fn base_create_id(tag: &HierarchyTag, source: &NodeId) -> String {
    let base = format!("{tag}-{source}");
    let budget = MAX_NODE_ID_LEN - ID_SUFFIX_RESERVE;
    if base.len() <= budget {
        return base;
    }

    let digest = sha2::Sha256::digest(source.as_str().as_bytes());
    let mut short = String::with_capacity(ID_DIGEST_BYTES * 2);
    for b in &digest[..ID_DIGEST_BYTES] {
        let _ = write!(&mut short, "{:02x}", b);
    }
    let mut cut = budget - short.len() - 1;
    while !base.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{short}", &base[..cut])
}

/// `<tag>-<source id>`, suffixed until unused. Deterministic for a given
/// snapshot so a retried batch re-creates the same ids.
fn derive_create_id(
    store: &NodeStore,
    staged_ids: &mut HashSet<NodeId>,
    tag: &HierarchyTag,
    source: &NodeId,
) -> Result<NodeId, EngineError> {
    let base = base_create_id(tag, source);
    for attempt in 1..=MAX_ID_SUFFIX {
        let raw = if attempt == 1 {
            base.clone()
        } else {
            format!("{base}-{attempt}")
        };
        let id = NodeId::try_new(raw)
            .map_err(|_| EngineError::InvalidRule("derived node id is invalid"))?;
        if !store.contains(&id) && !staged_ids.contains(&id) {
            staged_ids.insert(id.clone());
            return Ok(id);
        }
    }
    Err(EngineError::InvalidRule("derived node id space exhausted"))
}
