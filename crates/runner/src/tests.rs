#![forbid(unsafe_code)]

use crate::config::{parse_jobs, sha256_hex};
use crate::passes::{run_jobs, run_with_lock_wait};
use clap::Parser;
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};
use tk_core::{
    CrossReference, EngineError, HierarchyNode, HierarchyStore, HierarchyTag, MemoryStore, NodeId,
    PassOptions,
};
use tk_storage::{HistoryListRequest, SqliteStore};

const JOBS: &str = r#"
jobs:
  - name: patterns
    mirror:
      left: {tag: pattern}
      right: {tag: category, anchor: c-patterns, derive_code: true}
  - name: broken
    mirror:
      left: {tag: pattern}
      right: {tag: category, anchor: missing-anchor}
  - name: nav
    links: {scope: nav, target_tag: category}
"#;

fn id(value: &str) -> NodeId {
    NodeId::try_new(value).expect("node id")
}

fn tag(value: &str) -> HierarchyTag {
    HierarchyTag::try_new(value).expect("tag")
}

#[test]
fn cli_defaults() {
    let cli = crate::Cli::try_parse_from(["tk_runner"]).expect("parse");
    assert!(cli.holder.is_none());
    assert_eq!(
        crate::resolve_holder(cli.holder.as_deref()),
        format!("tk_runner:{}", std::process::id())
    );
    assert_eq!(crate::resolve_holder(Some(" ops-1 ")), "ops-1");
    assert_eq!(cli.lock_ttl_ms, 60_000);
    assert_eq!(cli.lock_wait_ms, 0);
    assert!(!cli.dry_run);
    assert!(cli.job.is_none());

    let cli = crate::Cli::try_parse_from([
        "tk_runner",
        "--job",
        "nav",
        "--lock-wait-ms",
        "500",
        "--dry-run",
    ])
    .expect("parse");
    assert_eq!(cli.job.as_deref(), Some("nav"));
    assert_eq!(cli.lock_wait_ms, 500);
    assert!(cli.dry_run);
}

#[test]
fn failing_job_does_not_stop_later_jobs() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = SqliteStore::open(dir.path()).expect("open store");
    store
        .node_upsert(&HierarchyNode::new(id("c-patterns"), tag("category"), "Patterns"))
        .expect("anchor");
    store
        .node_upsert(&HierarchyNode::new(id("1"), tag("pattern"), "Silk"))
        .expect("pattern");
    store
        .reference_upsert(&CrossReference {
            id: "nav-1".to_string(),
            scope: "nav".to_string(),
            label: "Silk".to_string(),
            target: String::new(),
        })
        .expect("reference");

    let jobs = parse_jobs(JOBS).expect("jobs");
    let selected: Vec<_> = jobs.iter().collect();
    let digest = sha256_hex(JOBS.as_bytes());
    let runs = run_jobs(
        &mut store,
        &selected,
        &PassOptions::default(),
        Duration::ZERO,
        &digest,
    );

    let failed: Vec<bool> = runs.iter().map(|run| run.failed()).collect();
    assert_eq!(failed, vec![false, true, false]);
    assert_eq!(
        store.reference_get("nav-1").expect("get").map(|r| r.target),
        Some("/shop?category=category-1".to_string())
    );

    let broken = runs[1].to_json();
    assert_eq!(broken["ok"], false);
    assert_eq!(broken["error"]["code"], "INVALID_RULE");

    let history = store
        .history_list(HistoryListRequest {
            job: None,
            limit: 10,
        })
        .expect("history");
    let outcomes: Vec<&str> = history.iter().map(|row| row.outcome.as_str()).collect();
    assert_eq!(outcomes, vec!["applied", "failed", "applied"]);
    assert!(
        history
            .iter()
            .all(|row| row.config_digest.as_deref() == Some(digest.as_str()))
    );
    assert_eq!(history[1].code.as_deref(), Some("INVALID_RULE"));
}

#[test]
fn busy_lock_fails_fast_without_wait() {
    let mut store = MemoryStore::default();
    store
        .acquire_pass_lock("someone-else", 60_000)
        .expect("manual lock");
    let jobs = parse_jobs(JOBS).expect("jobs");

    let started = Instant::now();
    let err = run_with_lock_wait(&mut store, &jobs[0], &PassOptions::default(), Duration::ZERO)
        .expect_err("busy");
    assert!(matches!(err, EngineError::ReconciliationBusy { .. }));
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn busy_lock_is_retried_until_the_wait_runs_out() {
    let mut store = MemoryStore::default();
    store
        .acquire_pass_lock("someone-else", 60_000)
        .expect("manual lock");
    let jobs = parse_jobs(JOBS).expect("jobs");

    let started = Instant::now();
    let err = run_with_lock_wait(
        &mut store,
        &jobs[0],
        &PassOptions::default(),
        Duration::from_millis(300),
    )
    .expect_err("still busy");
    assert_eq!(err.code(), "RECONCILIATION_BUSY");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(store.lock_holder(), Some("someone-else"));
}
