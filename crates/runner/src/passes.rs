#![forbid(unsafe_code)]

use serde_json::{Value, json};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tk_core::{EngineError, HierarchyStore, PassOptions, PassReport, RepairJob, run_pass};
use tk_storage::{HistoryAppendRequest, SqliteStore};

const LOCK_POLL_MS: u64 = 250;

/// Runs one pass, retrying while another writer holds the lock until
/// `wait` has elapsed. A zero wait fails fast.
pub(crate) fn run_with_lock_wait<S>(
    store: &mut S,
    job: &RepairJob,
    options: &PassOptions,
    wait: Duration,
) -> Result<PassReport, EngineError>
where
    S: HierarchyStore + ?Sized,
{
    let deadline = Instant::now() + wait;
    loop {
        match run_pass(store, job, options) {
            Err(EngineError::ReconciliationBusy {
                holder,
                expires_at_ms,
            }) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(EngineError::ReconciliationBusy {
                        holder,
                        expires_at_ms,
                    });
                }
                let pause = Duration::from_millis(LOCK_POLL_MS).min(deadline - now);
                tracing::info!(
                    job = %job.name,
                    holder = %holder,
                    wait_ms = pause.as_millis() as u64,
                    "waiting for pass lock"
                );
                std::thread::sleep(pause);
            }
            other => return other,
        }
    }
}

#[derive(Debug)]
pub(crate) struct JobRun {
    pub(crate) job: String,
    pub(crate) result: Result<PassReport, EngineError>,
}

impl JobRun {
    pub(crate) fn failed(&self) -> bool {
        self.result.is_err()
    }

    fn outcome(&self) -> &'static str {
        match &self.result {
            Ok(report) if report.dry_run => "dry_run",
            Ok(report) if report.applied => "applied",
            Ok(_) => "unchanged",
            Err(_) => "failed",
        }
    }

    /// One JSON document per job, printed on stdout.
    pub(crate) fn to_json(&self) -> Value {
        let finished_at = now_rfc3339();
        match &self.result {
            Ok(report) => json!({
                "job": self.job,
                "ok": true,
                "outcome": self.outcome(),
                "finished_at": finished_at,
                "report": report,
            }),
            Err(err) => json!({
                "job": self.job,
                "ok": false,
                "outcome": self.outcome(),
                "finished_at": finished_at,
                "error": {
                    "code": err.code(),
                    "message": err.to_string(),
                    "retryable": err.is_retryable(),
                },
            }),
        }
    }
}

/// Runs every job as its own pass. A failing job is recorded and the rest
/// still run.
pub(crate) fn run_jobs(
    store: &mut SqliteStore,
    jobs: &[&RepairJob],
    options: &PassOptions,
    lock_wait: Duration,
    config_digest: &str,
) -> Vec<JobRun> {
    let mut runs = Vec::with_capacity(jobs.len());
    for job in jobs {
        let result = run_with_lock_wait(store, job, options, lock_wait);
        if let Err(err) = &result {
            tracing::error!(job = %job.name, code = err.code(), error = %err, "pass failed");
        }
        let run = JobRun {
            job: job.name.clone(),
            result,
        };
        record_history(store, &run, &options.holder, config_digest);
        runs.push(run);
    }
    runs
}

fn record_history(store: &mut SqliteStore, run: &JobRun, holder: &str, config_digest: &str) {
    let (staged, report_json, code) = match &run.result {
        Ok(report) => (report.staged, serde_json::to_string(report).ok(), None),
        Err(err) => (Default::default(), None, Some(err.code().to_string())),
    };
    let request = HistoryAppendRequest {
        job: run.job.clone(),
        holder: holder.to_string(),
        outcome: run.outcome().to_string(),
        code,
        staged,
        report_json,
        config_digest: Some(config_digest.to_string()),
    };
    if let Err(err) = store.history_append(request) {
        // The pass itself already finished; history is best effort.
        tracing::warn!(job = %run.job, error = %err, "pass history not recorded");
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
