#![forbid(unsafe_code)]

use super::*;
use rusqlite::params;
use tk_core::BatchSummary;

const MAX_HISTORY_LIST_LIMIT: usize = 500;
const OUTCOMES: [&str; 4] = ["applied", "unchanged", "dry_run", "failed"];

fn normalize_outcome(raw: &str) -> Result<&'static str, StoreError> {
    let lowered = raw.trim().to_ascii_lowercase();
    OUTCOMES
        .into_iter()
        .find(|outcome| *outcome == lowered)
        .ok_or(StoreError::InvalidInput(
            "history.outcome is invalid (expected applied|unchanged|dry_run|failed)",
        ))
}

fn read_history_row(row: &rusqlite::Row<'_>) -> Result<PassHistoryRow, rusqlite::Error> {
    Ok(PassHistoryRow {
        seq: row.get(0)?,
        job: row.get(1)?,
        holder: row.get(2)?,
        outcome: row.get(3)?,
        code: row.get(4)?,
        staged: BatchSummary {
            created: from_sqlite_count(row.get(5)?),
            updated: from_sqlite_count(row.get(6)?),
            deleted: from_sqlite_count(row.get(7)?),
        },
        report_json: row.get(8)?,
        config_digest: row.get(9)?,
        recorded_at_ms: row.get(10)?,
    })
}

impl SqliteStore {
    /// Records a finished pass and returns its sequence number.
    pub fn history_append(&mut self, request: HistoryAppendRequest) -> Result<i64, StoreError> {
        let job = request.job.trim();
        if job.is_empty() {
            return Err(StoreError::InvalidInput("history.job must not be empty"));
        }
        let outcome = normalize_outcome(&request.outcome)?;
        if let Some(report_json) = request.report_json.as_deref()
            && serde_json::from_str::<serde_json::Value>(report_json).is_err()
        {
            return Err(StoreError::InvalidInput("history.report_json must be JSON"));
        }

        let now_ms = self.now_ms();
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO pass_history(
              job, holder, outcome, code, created, updated, deleted,
              report_json, config_digest, recorded_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                job,
                request.holder.as_str(),
                outcome,
                request.code.as_deref(),
                to_sqlite_i64(request.staged.created)?,
                to_sqlite_i64(request.staged.updated)?,
                to_sqlite_i64(request.staged.deleted)?,
                request.report_json.as_deref(),
                request.config_digest.as_deref(),
                now_ms,
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        Ok(seq)
    }

    /// Most recent passes first.
    pub fn history_list(
        &self,
        request: HistoryListRequest,
    ) -> Result<Vec<PassHistoryRow>, StoreError> {
        let limit = to_sqlite_i64(request.limit.clamp(1, MAX_HISTORY_LIST_LIMIT))?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT seq, job, holder, outcome, code, created, updated, deleted,
                   report_json, config_digest, recorded_at_ms
            FROM pass_history
            WHERE ?1 IS NULL OR job=?1
            ORDER BY seq DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(
            params![request.job.as_deref(), limit],
            read_history_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
