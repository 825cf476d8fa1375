#![forbid(unsafe_code)]

//! One reconciliation pass: lock, load, validate, plan, commit once. A
//! parent cycle skips only the stages that read the looping hierarchy.

use crate::batch::{BatchOutcome, StagedBatch};
use crate::boundary::{HierarchyStore, LockOutcome};
use crate::cycles::ensure_forest;
use crate::error::EngineError;
use crate::ids::HierarchyTag;
use crate::links::{LinkPlan, LinkRule, TargetView, plan_links};
use crate::mirror::{MirrorPlan, MirrorRule, plan_mirror};
use crate::model::RetiredNode;
use crate::node_store::NodeStore;
use crate::report::{CycleDetected, Diagnostic, PassReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_HOLDER: &str = "treekeeper";
pub const DEFAULT_LOCK_TTL_MS: u64 = 60_000;

/// What one pass repairs: a mirror pair, a set of references, or both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairJob {
    pub name: String,
    #[serde(default)]
    pub mirror: Option<MirrorRule>,
    #[serde(default)]
    pub links: Option<LinkRule>,
    #[serde(default)]
    pub retired: Vec<RetiredNode>,
}

impl RepairJob {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidRule("job name must not be empty"));
        }
        if self.mirror.is_none() && self.links.is_none() {
            return Err(EngineError::InvalidRule(
                "job must declare a mirror rule or a link rule",
            ));
        }
        if let Some(mirror) = self.mirror.as_ref() {
            mirror.validate()?;
        }
        if let Some(links) = self.links.as_ref() {
            links.validate()?;
        }
        Ok(())
    }

    /// Every hierarchy the pass reads, in first-mention order.
    pub fn tags(&self) -> Vec<HierarchyTag> {
        let mut tags: Vec<HierarchyTag> = Vec::new();
        let mentioned = self
            .mirror
            .iter()
            .flat_map(|m| m.tags())
            .chain(self.links.iter().map(|l| &l.target_tag));
        for tag in mentioned {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }
}

/// Shared flag a caller flips to abandon a pass before it commits.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct PassOptions {
    pub holder: String,
    pub lock_ttl_ms: u64,
    pub dry_run: bool,
    pub cancel: CancelToken,
}

/// `treekeeper:<pid>`, so two processes never renew each other's lease.
pub fn default_holder() -> String {
    format!("{DEFAULT_HOLDER}:{}", std::process::id())
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            holder: default_holder(),
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            dry_run: false,
            cancel: CancelToken::default(),
        }
    }
}

/// Holds the pass lock for as long as it lives and releases it on drop.
pub struct PassGuard<'s, S: HierarchyStore + ?Sized> {
    store: &'s mut S,
    holder: String,
}

impl<'s, S: HierarchyStore + ?Sized> PassGuard<'s, S> {
    pub fn acquire(store: &'s mut S, holder: &str, ttl_ms: u64) -> Result<Self, EngineError> {
        match store.acquire_pass_lock(holder, ttl_ms)? {
            LockOutcome::Acquired { expires_at_ms } => {
                tracing::debug!(holder, expires_at_ms, "pass lock acquired");
                Ok(Self {
                    store,
                    holder: holder.to_string(),
                })
            }
            LockOutcome::Held {
                holder: current,
                expires_at_ms,
            } => {
                tracing::warn!(holder = %current, expires_at_ms, "pass lock held elsewhere");
                Err(EngineError::ReconciliationBusy {
                    holder: current,
                    expires_at_ms,
                })
            }
        }
    }
}

impl<S: HierarchyStore + ?Sized> Deref for PassGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: HierarchyStore + ?Sized> DerefMut for PassGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

impl<S: HierarchyStore + ?Sized> Drop for PassGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.store.release_pass_lock(&self.holder) {
            // The lease expires on its own; nothing else to do here.
            tracing::warn!(holder = %self.holder, error = %err, "pass lock release failed");
        }
    }
}

pub fn run_pass<S>(
    store: &mut S,
    job: &RepairJob,
    options: &PassOptions,
) -> Result<PassReport, EngineError>
where
    S: HierarchyStore + ?Sized,
{
    job.validate()?;
    let span = tracing::info_span!("pass", job = %job.name, dry_run = options.dry_run);
    let _entered = span.enter();

    let mut guard = PassGuard::acquire(store, &options.holder, options.lock_ttl_ms)?;

    let tags = job.tags();
    let snapshot = NodeStore::load(&mut *guard, &tags)?;
    tracing::info!(nodes = snapshot.len(), hierarchies = tags.len(), "snapshot loaded");

    let mut diagnostics = Vec::new();
    let mut cyclic: BTreeMap<HierarchyTag, Vec<CycleDetected>> = BTreeMap::new();
    for tag in &tags {
        match ensure_forest(&snapshot, tag) {
            Ok(found) => diagnostics.extend(found),
            Err(EngineError::CycleDetected { tag, cycles }) => {
                cyclic.insert(tag, cycles);
            }
            Err(other) => return Err(other),
        }
    }

    // A cycle only stops the stages that read the looping hierarchy.
    let mut stages_run = 0usize;
    let mut first_skip: Option<(HierarchyTag, Vec<CycleDetected>)> = None;
    let mut skip = |stage: &str, tag: &HierarchyTag, diagnostics: &mut Vec<Diagnostic>| {
        let cycles = cyclic.get(tag).cloned().unwrap_or_default();
        tracing::error!(stage, tag = %tag, cycles = cycles.len(), "stage skipped on parent cycle");
        diagnostics.push(Diagnostic::StageSkipped {
            stage: stage.to_string(),
            tag: tag.clone(),
            cycles: cycles.clone(),
        });
        first_skip.get_or_insert_with(|| (tag.clone(), cycles));
    };

    let mut mirror_plan = MirrorPlan::default();
    if let Some(rule) = job.mirror.as_ref() {
        match rule.tags().into_iter().find(|tag| cyclic.contains_key(*tag)) {
            Some(tag) => skip("mirror", tag, &mut diagnostics),
            None => {
                mirror_plan = plan_mirror(&snapshot, rule, &job.retired, |id| {
                    guard.count_dependents(id).map_err(EngineError::from)
                })?;
                diagnostics.extend(mirror_plan.diagnostics.iter().cloned());
                stages_run += 1;
            }
        }
    }

    let mut link_plan = LinkPlan::default();
    if let Some(rule) = job.links.as_ref() {
        if cyclic.contains_key(&rule.target_tag) {
            skip("links", &rule.target_tag, &mut diagnostics);
        } else {
            link_plan = repair_links(&mut *guard, &snapshot, rule, &mirror_plan)?;
            diagnostics.extend(link_plan.diagnostics.iter().cloned());
            stages_run += 1;
        }
    }

    if stages_run == 0
        && let Some((tag, cycles)) = first_skip
    {
        return Err(EngineError::CycleDetected { tag, cycles });
    }

    let batch = StagedBatch {
        creates: mirror_plan.creates,
        updates: link_plan.updates,
        deletes: mirror_plan.deletes,
    };
    let staged = batch.summary();

    if options.cancel.is_cancelled() {
        tracing::warn!(staged = staged.total(), "pass cancelled before commit");
        return Err(EngineError::Cancelled);
    }

    let applied = if options.dry_run || batch.is_empty() {
        false
    } else {
        match guard.apply_batch(&batch)? {
            BatchOutcome::Applied(summary) => {
                tracing::info!(
                    created = summary.created,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    "batch applied"
                );
                true
            }
            BatchOutcome::PartialFailure {
                applied,
                pending,
                message,
            } => {
                tracing::error!(
                    applied = applied.len(),
                    pending = pending.len(),
                    message = %message,
                    "batch partially applied"
                );
                return Err(EngineError::PartialFailure {
                    applied,
                    pending,
                    message,
                });
            }
        }
    };

    tracing::info!(
        staged = staged.total(),
        applied,
        diagnostics = diagnostics.len(),
        "pass finished"
    );
    Ok(PassReport {
        job: job.name.clone(),
        dry_run: options.dry_run,
        staged,
        applied,
        batch,
        diagnostics,
    })
}

fn repair_links<S>(
    store: &mut S,
    snapshot: &NodeStore,
    rule: &LinkRule,
    mirror_plan: &MirrorPlan,
) -> Result<LinkPlan, EngineError>
where
    S: HierarchyStore + ?Sized,
{
    let references = store.fetch_all_cross_references(&rule.scope)?;
    let view = TargetView::build(snapshot, &rule.target_tag, Some(mirror_plan));
    plan_links(&view, rule, &references)
}
