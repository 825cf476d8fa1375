#![forbid(unsafe_code)]

//! Heals cross-references (menu links and the like) whose target drifted
//! after a rename, an id change or a restructure.

use crate::batch::ReferenceUpdate;
use crate::error::EngineError;
use crate::ids::{HierarchyTag, NodeId};
use crate::mirror::MirrorPlan;
use crate::model::{CrossReference, label_key};
use crate::node_store::NodeStore;
use crate::report::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const ID_PLACEHOLDER: &str = "{id}";
pub const DEFAULT_TARGET_TEMPLATE: &str = "/shop?category={id}";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticTarget {
    pub label: String,
    pub target: String,
}

impl StaticTarget {
    fn new(label: &str, target: &str) -> Self {
        Self {
            label: label.to_string(),
            target: target.to_string(),
        }
    }
}

/// Intents that never resolve through a hierarchy.
pub fn default_static_targets() -> Vec<StaticTarget> {
    vec![
        StaticTarget::new("New Arrivals", "/shop?filter=new"),
        StaticTarget::new("Sale", "/shop?filter=sale"),
        StaticTarget::new("Home", "/"),
    ]
}

fn default_target_template() -> String {
    DEFAULT_TARGET_TEMPLATE.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRule {
    /// Which references to load (`nav`, `footer`, ...).
    pub scope: String,
    pub target_tag: HierarchyTag,
    #[serde(default = "default_target_template")]
    pub target_template: String,
    #[serde(default = "default_static_targets")]
    pub static_targets: Vec<StaticTarget>,
}

impl LinkRule {
    pub fn new(scope: impl Into<String>, target_tag: HierarchyTag) -> Self {
        Self {
            scope: scope.into(),
            target_tag,
            target_template: default_target_template(),
            static_targets: default_static_targets(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.scope.trim().is_empty() {
            return Err(EngineError::InvalidRule("link scope must not be empty"));
        }
        if self.target_template.matches(ID_PLACEHOLDER).count() != 1 {
            return Err(EngineError::InvalidRule(
                "target template must contain {id} exactly once",
            ));
        }
        Ok(())
    }

    pub fn encode(&self, id: &NodeId) -> String {
        self.target_template.replace(ID_PLACEHOLDER, id.as_str())
    }

    /// The node id a template-shaped target points at, if any.
    pub fn decode<'a>(&self, target: &'a str) -> Option<&'a str> {
        let (prefix, suffix) = self.target_template.split_once(ID_PLACEHOLDER)?;
        let inner = target.strip_prefix(prefix)?.strip_suffix(suffix)?;
        (!inner.is_empty()).then_some(inner)
    }

    fn static_target(&self, label: &str) -> Option<&StaticTarget> {
        let key = label_key(label);
        self.static_targets
            .iter()
            .find(|candidate| label_key(&candidate.label) == key)
    }
}

/// Name lookup over the target hierarchy as it will look once the staged
/// mirror batch lands.
#[derive(Clone, Debug, Default)]
pub struct TargetView {
    by_label: BTreeMap<String, Vec<NodeId>>,
    live: HashSet<NodeId>,
}

impl TargetView {
    pub fn build(store: &NodeStore, tag: &HierarchyTag, staged: Option<&MirrorPlan>) -> Self {
        let doomed: HashSet<&NodeId> = staged
            .map(|plan| plan.deletes.iter().map(|d| &d.id).collect())
            .unwrap_or_default();

        let mut view = Self::default();
        for node in store.nodes_of(tag) {
            if doomed.contains(&node.id) {
                continue;
            }
            view.insert(&node.name, &node.id);
        }
        if let Some(plan) = staged {
            for create in plan.creates.iter().filter(|c| &c.tag == tag) {
                view.insert(&create.name, &create.id);
            }
        }
        view
    }

    fn insert(&mut self, name: &str, id: &NodeId) {
        self.by_label
            .entry(label_key(name))
            .or_default()
            .push(id.clone());
        self.live.insert(id.clone());
    }

    pub fn lookup(&self, label: &str) -> &[NodeId] {
        self.by_label
            .get(&label_key(label))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_live(&self, id: &str) -> bool {
        NodeId::try_new(id).is_ok_and(|id| self.live.contains(&id))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkPlan {
    pub updates: Vec<ReferenceUpdate>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Rewrites every reference whose label resolves to a different target than
/// the one stored. Static intents win over hierarchy names. References are
/// never deleted; unresolvable ones are reported and left alone.
pub fn plan_links(
    view: &TargetView,
    rule: &LinkRule,
    references: &[CrossReference],
) -> Result<LinkPlan, EngineError> {
    rule.validate()?;
    let mut plan = LinkPlan::default();

    for reference in references {
        let desired = if let Some(fixed) = rule.static_target(&reference.label) {
            fixed.target.clone()
        } else {
            match view.lookup(&reference.label) {
                [only] => rule.encode(only),
                [] => {
                    if !already_resolves(view, rule, &reference.target) {
                        plan.diagnostics
                            .push(unresolved(reference, "no matching node"));
                    }
                    continue;
                }
                _ => {
                    plan.diagnostics.push(unresolved(reference, "ambiguous label"));
                    continue;
                }
            }
        };

        if desired == reference.target {
            continue;
        }
        tracing::debug!(
            scope = %reference.scope,
            reference = %reference.id,
            from = %reference.target,
            to = %desired,
            "reference repair staged"
        );
        plan.updates.push(ReferenceUpdate {
            reference_id: reference.id.clone(),
            scope: reference.scope.clone(),
            label: reference.label.clone(),
            previous_target: reference.target.clone(),
            target: desired,
        });
    }

    for diagnostic in &plan.diagnostics {
        if let Diagnostic::UnresolvedReference {
            reference_id,
            label,
            reason,
            ..
        } = diagnostic
        {
            tracing::warn!(reference = %reference_id, label = %label, reason = %reason, "unresolved reference");
        }
    }
    Ok(plan)
}

fn already_resolves(view: &TargetView, rule: &LinkRule, target: &str) -> bool {
    if rule.static_targets.iter().any(|s| s.target == target) {
        return true;
    }
    rule.decode(target).is_some_and(|id| view.is_live(id))
}

fn unresolved(reference: &CrossReference, reason: &str) -> Diagnostic {
    Diagnostic::UnresolvedReference {
        scope: reference.scope.clone(),
        reference_id: reference.id.clone(),
        label: reference.label.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::NodeCreate;
    use crate::model::HierarchyNode;
    use pretty_assertions::assert_eq;

    fn id(value: &str) -> NodeId {
        NodeId::try_new(value).unwrap()
    }

    fn category() -> HierarchyTag {
        HierarchyTag::try_new("category").unwrap()
    }

    fn link(ref_id: &str, label: &str, target: &str) -> CrossReference {
        CrossReference {
            id: ref_id.to_string(),
            scope: "nav".to_string(),
            label: label.to_string(),
            target: target.to_string(),
        }
    }

    fn store() -> NodeStore {
        NodeStore::from_nodes(vec![
            HierarchyNode::new(id("c1"), category(), "Silk"),
            HierarchyNode::new(id("c2"), category(), "Cotton"),
            HierarchyNode::new(id("c3"), category(), "Linen"),
            HierarchyNode::new(id("c4"), category(), "Linen").with_parent(id("c2")),
        ])
    }

    #[test]
    fn renamed_target_is_rewritten_to_current_id() {
        let view = TargetView::build(&store(), &category(), None);
        let rule = LinkRule::new("nav", category());
        let plan = plan_links(&view, &rule, &[link("n1", "Silk", "/shop?category=old-9")]).unwrap();

        assert_eq!(
            plan.updates,
            vec![ReferenceUpdate {
                reference_id: "n1".to_string(),
                scope: "nav".to_string(),
                label: "Silk".to_string(),
                previous_target: "/shop?category=old-9".to_string(),
                target: "/shop?category=c1".to_string(),
            }]
        );
    }

    #[test]
    fn sale_is_static_even_when_a_category_is_named_sale() {
        let mut nodes: Vec<HierarchyNode> = store().nodes_of(&category()).cloned().collect();
        nodes.push(HierarchyNode::new(id("c9"), category(), "Sale"));
        let view = TargetView::build(&NodeStore::from_nodes(nodes), &category(), None);
        let rule = LinkRule::new("nav", category());

        let plan = plan_links(&view, &rule, &[link("n1", "sale", "/shop?category=c9")]).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].target, "/shop?filter=sale");

        let empty = TargetView::default();
        let plan = plan_links(&empty, &rule, &[link("n1", "Sale", "")]).unwrap();
        assert_eq!(plan.updates[0].target, "/shop?filter=sale");
    }

    #[test]
    fn unknown_and_ambiguous_labels_are_reported_not_touched() {
        let view = TargetView::build(&store(), &category(), None);
        let rule = LinkRule::new("nav", category());
        let plan = plan_links(
            &view,
            &rule,
            &[
                link("n1", "Wool", "/shop?category=gone"),
                link("n2", "Linen", "/shop?category=c3"),
                link("n3", "Custom Silk Link", "/shop?category=c1"),
            ],
        )
        .unwrap();

        assert!(plan.updates.is_empty());
        let reasons: Vec<_> = plan
            .diagnostics
            .iter()
            .map(|d| match d {
                Diagnostic::UnresolvedReference {
                    reference_id,
                    reason,
                    ..
                } => (reference_id.as_str(), reason.as_str()),
                other => panic!("unexpected diagnostic {other:?}"),
            })
            .collect();
        assert_eq!(
            reasons,
            vec![("n1", "no matching node"), ("n2", "ambiguous label")]
        );
    }

    #[test]
    fn staged_mirror_changes_are_visible() {
        let staged = MirrorPlan {
            creates: vec![NodeCreate {
                id: id("category-p1"),
                tag: category(),
                name: "Velvet".to_string(),
                parent_id: None,
                code: Some("VEL".to_string()),
                twin_of: id("p1"),
            }],
            deletes: vec![crate::batch::NodeDelete {
                id: id("c1"),
                tag: category(),
                name: "Silk".to_string(),
                parent_id: None,
            }],
            diagnostics: Vec::new(),
        };
        let view = TargetView::build(&store(), &category(), Some(&staged));
        assert_eq!(view.lookup("velvet"), &[id("category-p1")]);
        assert!(view.lookup("Silk").is_empty());
    }

    #[test]
    fn repair_is_idempotent() {
        let view = TargetView::build(&store(), &category(), None);
        let rule = LinkRule::new("nav", category());
        let mut references = vec![
            link("n1", "Silk", "/shop?category=old"),
            link("n2", "Home", "/home"),
            link("n3", "Cotton", "/shop?category=c2"),
        ];

        let first = plan_links(&view, &rule, &references).unwrap();
        assert_eq!(first.updates.len(), 2);
        for update in &first.updates {
            if let Some(reference) = references.iter_mut().find(|r| r.id == update.reference_id) {
                reference.target = update.target.clone();
            }
        }

        let second = plan_links(&view, &rule, &references).unwrap();
        assert!(second.updates.is_empty());
    }

    #[test]
    fn template_must_carry_one_placeholder() {
        let mut rule = LinkRule::new("nav", category());
        rule.target_template = "/shop".to_string();
        assert!(matches!(rule.validate(), Err(EngineError::InvalidRule(_))));

        let rule = LinkRule::new("nav", category());
        assert_eq!(rule.decode("/shop?category=c7"), Some("c7"));
        assert_eq!(rule.decode("/shop?filter=new"), None);
    }
}
