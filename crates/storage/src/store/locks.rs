#![forbid(unsafe_code)]

use super::*;
use rusqlite::{OptionalExtension, params};
use tk_core::LockOutcome;

/// One lease guards every reconciliation pass against this store.
const PASS_LOCK_NAME: &str = "reconcile";
const MAX_LOCK_TTL_MS: u64 = 600_000; // 10 minutes
const MIN_LOCK_TTL_MS: u64 = 1_000; // 1 second
const MAX_HOLDER_LEN: usize = 256;

fn normalize_holder(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("lock.holder must not be empty"));
    }
    if raw.len() > MAX_HOLDER_LEN {
        return Err(StoreError::InvalidInput("lock.holder is too long"));
    }
    Ok(raw.to_string())
}

fn read_lock_row(row: &rusqlite::Row<'_>) -> Result<PassLockRow, rusqlite::Error> {
    Ok(PassLockRow {
        holder: row.get(0)?,
        acquired_at_ms: row.get(1)?,
        expires_at_ms: row.get(2)?,
    })
}

impl SqliteStore {
    /// The current lease row, expired or not.
    pub fn pass_lock_get(&self) -> Result<Option<PassLockRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT holder, acquired_at_ms, expires_at_ms FROM pass_locks WHERE name=?1",
                params![PASS_LOCK_NAME],
                read_lock_row,
            )
            .optional()?)
    }

    pub(super) fn pass_lock_acquire(
        &mut self,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<LockOutcome, StoreError> {
        let holder = normalize_holder(holder)?;
        let now_ms = self.now_ms();
        let ttl_ms = ttl_ms.clamp(MIN_LOCK_TTL_MS, MAX_LOCK_TTL_MS);
        let expires_at_ms = now_ms.saturating_add(ttl_ms.min(i64::MAX as u64) as i64);

        let tx = self.conn.transaction()?;
        let current = tx
            .query_row(
                "SELECT holder, acquired_at_ms, expires_at_ms, session FROM pass_locks WHERE name=?1",
                params![PASS_LOCK_NAME],
                |row| Ok((read_lock_row(row)?, row.get::<_, String>(3)?)),
            )
            .optional()?;

        // Renewal needs the same holder on the same handle.
        if let Some((current, session)) = current
            && (current.holder != holder || session != self.session)
            && current.expires_at_ms > now_ms
        {
            return Ok(LockOutcome::Held {
                holder: current.holder,
                expires_at_ms: current.expires_at_ms,
            });
        }

        tx.execute(
            r#"
            INSERT INTO pass_locks(name, holder, session, acquired_at_ms, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
              holder=excluded.holder,
              session=excluded.session,
              acquired_at_ms=excluded.acquired_at_ms,
              expires_at_ms=excluded.expires_at_ms
            "#,
            params![PASS_LOCK_NAME, holder, self.session, now_ms, expires_at_ms],
        )?;
        tx.commit()?;
        Ok(LockOutcome::Acquired { expires_at_ms })
    }

    /// Only the lease this handle took for `holder` is removed.
    pub(super) fn pass_lock_release(&mut self, holder: &str) -> Result<bool, StoreError> {
        let holder = normalize_holder(holder)?;
        let removed = self.conn.execute(
            "DELETE FROM pass_locks WHERE name=?1 AND holder=?2 AND session=?3",
            params![PASS_LOCK_NAME, holder, self.session],
        )?;
        Ok(removed > 0)
    }
}

/// Fails unless this handle still holds an unexpired lease. Runs inside the
/// batch transaction so a lease lost mid-pass never commits.
pub(super) fn ensure_lease_tx(
    tx: &rusqlite::Transaction<'_>,
    session: &str,
    now_ms: i64,
) -> Result<(), StoreError> {
    let held = tx
        .query_row(
            "SELECT 1 FROM pass_locks WHERE name=?1 AND session=?2 AND expires_at_ms > ?3",
            params![PASS_LOCK_NAME, session, now_ms],
            |_| Ok(()),
        )
        .optional()?;
    match held {
        Some(()) => Ok(()),
        None => Err(StoreError::LockLost),
    }
}
