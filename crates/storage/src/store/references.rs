#![forbid(unsafe_code)]

use super::*;
use rusqlite::{OptionalExtension, Transaction, params};
use tk_core::{CrossReference, ReferenceUpdate};

const MAX_REFERENCE_ID_LEN: usize = 256;
const MAX_SCOPE_LEN: usize = 64;

fn normalize_reference(reference: &CrossReference) -> Result<(), StoreError> {
    let id = reference.id.trim();
    if id.is_empty() {
        return Err(StoreError::InvalidInput("reference.id must not be empty"));
    }
    if id.len() > MAX_REFERENCE_ID_LEN {
        return Err(StoreError::InvalidInput("reference.id is too long"));
    }
    let scope = reference.scope.trim();
    if scope.is_empty() {
        return Err(StoreError::InvalidInput("reference.scope must not be empty"));
    }
    if scope.len() > MAX_SCOPE_LEN {
        return Err(StoreError::InvalidInput("reference.scope is too long"));
    }
    Ok(())
}

fn read_reference_row(row: &rusqlite::Row<'_>) -> Result<CrossReference, rusqlite::Error> {
    Ok(CrossReference {
        id: row.get(0)?,
        scope: row.get(1)?,
        label: row.get(2)?,
        target: row.get(3)?,
    })
}

impl SqliteStore {
    pub fn reference_upsert(&mut self, reference: &CrossReference) -> Result<(), StoreError> {
        normalize_reference(reference)?;
        let now_ms = self.now_ms();
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO cross_references(id, scope, label, target, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
              scope=excluded.scope,
              label=excluded.label,
              target=excluded.target,
              updated_at_ms=excluded.updated_at_ms
            "#,
            params![
                reference.id.trim(),
                reference.scope.trim(),
                reference.label.as_str(),
                reference.target.as_str(),
                now_ms,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn reference_get(&self, id: &str) -> Result<Option<CrossReference>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, scope, label, target FROM cross_references WHERE id=?1",
                params![id],
                read_reference_row,
            )
            .optional()?)
    }

    /// Every reference in one scope, ordered by id.
    pub fn references_list(&self, scope: &str) -> Result<Vec<CrossReference>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, scope, label, target FROM cross_references \
             WHERE scope=?1 \
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![scope], read_reference_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Rewrites the target. A reference removed since the snapshot, or one that
/// already holds the target, counts as nothing to do.
pub(super) fn reference_update_tx(
    tx: &Transaction<'_>,
    update: &ReferenceUpdate,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let changed = tx.execute(
        "UPDATE cross_references SET target=?2, updated_at_ms=?3 WHERE id=?1 AND target<>?2",
        params![update.reference_id.as_str(), update.target.as_str(), now_ms],
    )?;
    Ok(changed > 0)
}
