#![forbid(unsafe_code)]

use tk_core::{
    CancelToken, CrossReference, Diagnostic, EngineError, HierarchyNode, HierarchyStore,
    HierarchyTag, LinkRule, MemoryStore, MirrorRule, MirrorSide, NodeId, PassOptions, RepairJob,
    RetiredNode, StagedOp, detect_cycles, run_pass,
};

fn id(value: &str) -> NodeId {
    NodeId::try_new(value).expect("node id")
}

fn pattern() -> HierarchyTag {
    HierarchyTag::try_new("pattern").expect("tag")
}

fn category() -> HierarchyTag {
    HierarchyTag::try_new("category").expect("tag")
}

fn mirror_job(anchor: Option<&str>) -> RepairJob {
    RepairJob {
        name: "patterns".to_string(),
        mirror: Some(MirrorRule {
            left: MirrorSide {
                tag: pattern(),
                anchor: None,
                derive_code: false,
            },
            right: MirrorSide {
                tag: category(),
                anchor: anchor.map(id),
                derive_code: true,
            },
        }),
        links: None,
        retired: Vec::new(),
    }
}

fn nav(ref_id: &str, label: &str, target: &str) -> CrossReference {
    CrossReference {
        id: ref_id.to_string(),
        scope: "nav".to_string(),
        label: label.to_string(),
        target: target.to_string(),
    }
}

#[test]
fn silk_pattern_gets_a_category_and_second_run_is_quiet() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk"));

    let report = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).expect("pass");
    assert!(report.applied);
    assert_eq!(report.staged.created, 1);
    let created = store.node(&id("category-1")).expect("mirrored category");
    assert_eq!(created.name, "Silk");
    assert_eq!(created.parent_id, None);
    assert_eq!(created.code.as_deref(), Some("SIL"));

    let writes = store.writes();
    let again = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).expect("pass");
    assert_eq!(again.staged.total(), 0);
    assert!(!again.applied);
    assert_eq!(store.writes(), writes);
}

#[test]
fn links_follow_staged_mirror_creates() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("c-pat"), category(), "Patterns"));
    store.insert_node(HierarchyNode::new(id("p1"), pattern(), "Velvet"));
    store.insert_reference(nav("n1", "Velvet", "/shop?category=deleted"));
    store.insert_reference(nav("n2", "Sale", "/sale"));
    store.insert_reference(nav("n3", "Mystery", "/x"));

    let mut job = mirror_job(Some("c-pat"));
    job.links = Some(LinkRule::new("nav", category()));

    let report = run_pass(&mut store, &job, &PassOptions::default()).expect("pass");
    assert_eq!(report.staged.created, 1);
    assert_eq!(report.staged.updated, 2);
    assert_eq!(
        store.reference("n1").map(|r| r.target.as_str()),
        Some("/shop?category=category-p1")
    );
    assert_eq!(
        store.reference("n2").map(|r| r.target.as_str()),
        Some("/shop?filter=sale")
    );
    assert_eq!(store.reference("n3").map(|r| r.target.as_str()), Some("/x"));
    assert_eq!(report.diagnostics_of("UNRESOLVED_REFERENCE").count(), 1);

    let again = run_pass(&mut store, &job, &PassOptions::default()).expect("pass");
    assert_eq!(again.staged.total(), 0);
}

#[test]
fn cycle_blocks_pass_without_writes_and_releases_lock() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("a"), pattern(), "A").with_parent(id("b")));
    store.insert_node(HierarchyNode::new(id("b"), pattern(), "B").with_parent(id("c")));
    store.insert_node(HierarchyNode::new(id("c"), pattern(), "C").with_parent(id("a")));
    store.insert_node(HierarchyNode::new(id("d"), pattern(), "Free"));

    let err = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).unwrap_err();
    match err {
        EngineError::CycleDetected { tag, cycles } => {
            assert_eq!(tag, pattern());
            assert_eq!(cycles.len(), 1);
            assert!(cycles[0].members.contains(&cycles[0].cycle_node_id));
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    assert_eq!(store.writes(), 0);
    assert_eq!(store.lock_holder(), None);
}

#[test]
fn pattern_cycle_skips_mirror_but_links_still_heal() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("a"), pattern(), "A").with_parent(id("b")));
    store.insert_node(HierarchyNode::new(id("b"), pattern(), "B").with_parent(id("a")));
    store.insert_node(HierarchyNode::new(id("c1"), category(), "Silk"));
    store.insert_reference(nav("n1", "Silk", "/shop?category=old"));

    let mut job = mirror_job(None);
    job.links = Some(LinkRule::new("nav", category()));
    let report = run_pass(&mut store, &job, &PassOptions::default()).expect("pass");

    assert_eq!(report.staged.created, 0);
    assert_eq!(report.staged.updated, 1);
    assert_eq!(
        store.reference("n1").map(|r| r.target.as_str()),
        Some("/shop?category=c1")
    );
    assert!(matches!(
        report.diagnostics_of("STAGE_SKIPPED").collect::<Vec<_>>().as_slice(),
        [Diagnostic::StageSkipped { stage, tag, cycles }]
            if stage == "mirror" && tag == &pattern() && cycles.len() == 1
    ));
}

#[test]
fn cycle_in_the_link_target_fails_a_links_only_job() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("c1"), category(), "Silk").with_parent(id("c1")));
    store.insert_reference(nav("n1", "Silk", "/shop?category=old"));
    let job = RepairJob {
        name: "nav".to_string(),
        mirror: None,
        links: Some(LinkRule::new("nav", category())),
        retired: Vec::new(),
    };

    let err = run_pass(&mut store, &job, &PassOptions::default()).unwrap_err();
    assert_eq!(err.code(), "CYCLE_DETECTED");
    assert_eq!(
        store.reference("n1").map(|r| r.target.as_str()),
        Some("/shop?category=old")
    );
}

#[test]
fn second_writer_is_refused_until_lease_expires() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk"));
    store
        .acquire_pass_lock("admin-session", 5_000)
        .expect("manual lock");

    let err = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).unwrap_err();
    match err {
        EngineError::ReconciliationBusy {
            holder,
            expires_at_ms,
        } => {
            assert_eq!(holder, "admin-session");
            assert_eq!(expires_at_ms, 5_000);
        }
        other => panic!("expected ReconciliationBusy, got {other:?}"),
    }
    assert_eq!(store.lock_holder(), Some("admin-session"));
    assert_eq!(store.writes(), 0);

    store.set_now_ms(5_001);
    let report = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).expect("pass");
    assert!(report.applied);
    assert_eq!(store.lock_holder(), None);
}

#[test]
fn cancelled_pass_writes_nothing() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk"));
    let cancel = CancelToken::new();
    cancel.cancel();
    let options = PassOptions {
        cancel,
        ..PassOptions::default()
    };

    let err = run_pass(&mut store, &mirror_job(None), &options).unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(store.writes(), 0);
    assert_eq!(store.lock_holder(), None);
}

#[test]
fn dry_run_reports_without_applying() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk"));
    let options = PassOptions {
        dry_run: true,
        ..PassOptions::default()
    };

    let report = run_pass(&mut store, &mirror_job(None), &options).expect("pass");
    assert!(report.dry_run);
    assert!(!report.applied);
    assert_eq!(report.batch.creates.len(), 1);
    assert_eq!(store.writes(), 0);
}

#[test]
fn partial_failure_reports_pending_ops_and_retry_converges() {
    let mut store = MemoryStore::non_transactional();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk"));
    store.insert_node(HierarchyNode::new(id("2"), pattern(), "Linen"));
    store.insert_node(HierarchyNode::new(id("3"), pattern(), "Wool"));
    store.fail_next_batch_after(1);

    let err = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).unwrap_err();
    let pending = match err {
        EngineError::PartialFailure {
            applied, pending, ..
        } => {
            assert_eq!(applied.len(), 1);
            pending
        }
        other => panic!("expected PartialFailure, got {other:?}"),
    };
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|op| matches!(op, StagedOp::Create(_))));
    assert_eq!(store.writes(), 1);

    let retry = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).expect("retry");
    assert_eq!(retry.staged.created, 2);
    let settled = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).expect("pass");
    assert_eq!(settled.staged.total(), 0);
}

#[test]
fn transactional_failure_rolls_back_whole_batch() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk"));
    store.insert_node(HierarchyNode::new(id("2"), pattern(), "Linen"));
    store.fail_next_batch_after(1);

    let err = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).unwrap_err();
    assert!(matches!(err, EngineError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(store.writes(), 0);
}

#[test]
fn unavailable_store_aborts_before_any_write() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk"));
    store.set_unavailable(true);

    let err = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).unwrap_err();
    assert_eq!(err.code(), "STORE_UNAVAILABLE");
    assert_eq!(store.writes(), 0);
}

#[test]
fn retired_pattern_removes_free_subcategory_only() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("c-pat"), category(), "Patterns"));
    store.insert_node(HierarchyNode::new(id("c1"), category(), "Silk").with_parent(id("c-pat")));
    store.insert_node(HierarchyNode::new(id("c2"), category(), "Wool").with_parent(id("c-pat")));
    store.set_dependents(&id("c2"), 3);

    let mut job = mirror_job(Some("c-pat"));
    job.retired = vec![
        RetiredNode {
            id: None,
            tag: pattern(),
            name: "Silk".to_string(),
            parent_id: None,
        },
        RetiredNode {
            id: None,
            tag: pattern(),
            name: "Wool".to_string(),
            parent_id: None,
        },
    ];

    let report = run_pass(&mut store, &job, &PassOptions::default()).expect("pass");
    assert_eq!(report.staged.deleted, 1);
    assert_eq!(report.staged.created, 0);
    assert!(store.node(&id("c1")).is_none());
    assert!(store.node(&id("c2")).is_some());
    assert!(report.diagnostics.iter().any(|d| matches!(
        d,
        Diagnostic::DeletionBlocked { node_id, reason, .. }
            if node_id == &id("c2") && reason == "has dependents"
    )));
}

#[test]
fn retired_pattern_subtree_stays_gone_on_the_next_pass() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("c-pat"), category(), "Patterns"));
    store.insert_node(HierarchyNode::new(id("p1"), pattern(), "Florals"));
    store.insert_node(HierarchyNode::new(id("p2"), pattern(), "Roses").with_parent(id("p1")));
    run_pass(&mut store, &mirror_job(Some("c-pat")), &PassOptions::default()).expect("mirror");
    assert!(store.node(&id("category-p2")).is_some());

    store.remove_node(&id("p2"));
    store.remove_node(&id("p1"));
    let mut job = mirror_job(Some("c-pat"));
    job.retired = vec![
        RetiredNode {
            id: Some(id("p1")),
            tag: pattern(),
            name: "Florals".to_string(),
            parent_id: None,
        },
        RetiredNode {
            id: Some(id("p2")),
            tag: pattern(),
            name: "Roses".to_string(),
            parent_id: Some(id("p1")),
        },
    ];
    let report = run_pass(&mut store, &job, &PassOptions::default()).expect("retire");
    assert_eq!(report.staged.deleted, 2);
    assert!(report.diagnostics.is_empty());
    assert!(store.node(&id("category-p1")).is_none());
    assert!(store.node(&id("category-p2")).is_none());

    let quiet = run_pass(&mut store, &mirror_job(Some("c-pat")), &PassOptions::default())
        .expect("follow-up");
    assert_eq!(quiet.staged.total(), 0);
}

#[test]
fn dangling_parent_is_reported_not_fatal() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("1"), pattern(), "Silk").with_parent(id("ghost")));
    store.insert_node(HierarchyNode::new(id("2"), pattern(), "Linen"));

    let report = run_pass(&mut store, &mirror_job(None), &PassOptions::default()).expect("pass");
    assert_eq!(report.diagnostics_of("DANGLING_PARENT").count(), 1);
    // The orphan has nowhere to hang its twin; the healthy root is mirrored.
    assert_eq!(report.staged.created, 1);
    assert_eq!(report.batch.creates[0].name, "Linen");
}

#[test]
fn job_without_rules_is_rejected() {
    let mut store = MemoryStore::default();
    let job = RepairJob {
        name: "empty".to_string(),
        mirror: None,
        links: None,
        retired: Vec::new(),
    };
    let err = run_pass(&mut store, &job, &PassOptions::default()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidRule(_)));
    assert_eq!(store.lock_holder(), None);
}

#[test]
fn cycle_scan_over_store_after_pass_is_clean() {
    let mut store = MemoryStore::default();
    store.insert_node(HierarchyNode::new(id("c-pat"), category(), "Patterns"));
    store.insert_node(HierarchyNode::new(id("p1"), pattern(), "Silk"));
    store.insert_node(HierarchyNode::new(id("p2"), pattern(), "Raw").with_parent(id("p1")));
    run_pass(&mut store, &mirror_job(Some("c-pat")), &PassOptions::default()).expect("pass");

    let snapshot = tk_core::NodeStore::from_nodes(store.nodes().cloned());
    assert!(detect_cycles(&snapshot, &category()).is_forest());
    assert_eq!(
        store.node(&id("category-p2")).and_then(|n| n.parent_id.clone()),
        Some(id("category-p1"))
    );
}
