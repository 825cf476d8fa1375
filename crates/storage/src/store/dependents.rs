#![forbid(unsafe_code)]

use super::*;
use rusqlite::{OptionalExtension, params};
use tk_core::NodeId;

const MAX_DEPENDENT_KIND_LEN: usize = 32;
const MAX_DEPENDENT_ID_LEN: usize = 256;

fn normalize_dependent_key(kind: &str, id: &str) -> Result<(String, String), StoreError> {
    let kind = kind.trim();
    if kind.is_empty() {
        return Err(StoreError::InvalidInput("dependent.kind must not be empty"));
    }
    if kind.len() > MAX_DEPENDENT_KIND_LEN {
        return Err(StoreError::InvalidInput("dependent.kind is too long"));
    }
    let id = id.trim();
    if id.is_empty() {
        return Err(StoreError::InvalidInput("dependent.id must not be empty"));
    }
    if id.len() > MAX_DEPENDENT_ID_LEN {
        return Err(StoreError::InvalidInput("dependent.id is too long"));
    }
    Ok((kind.to_ascii_lowercase(), id.to_string()))
}

impl SqliteStore {
    /// Points a dependent record at a node, replacing any previous target.
    /// The node must exist.
    pub fn dependent_attach(&mut self, request: DependentAttachRequest) -> Result<(), StoreError> {
        let (kind, id) = normalize_dependent_key(&request.kind, &request.id)?;
        let now_ms = self.now_ms();
        let tx = self.conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM hierarchy_nodes WHERE id=?1",
                params![request.node_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::UnknownId);
        }

        tx.execute(
            r#"
            INSERT INTO node_dependents(kind, id, node_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(kind, id) DO UPDATE SET node_id=excluded.node_id
            "#,
            params![kind, id, request.node_id.as_str(), now_ms],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a dependent was removed.
    pub fn dependent_detach(&mut self, request: DependentDetachRequest) -> Result<bool, StoreError> {
        let (kind, id) = normalize_dependent_key(&request.kind, &request.id)?;
        let removed = self.conn.execute(
            "DELETE FROM node_dependents WHERE kind=?1 AND id=?2",
            params![kind, id],
        )?;
        Ok(removed > 0)
    }

    pub fn dependents_count(&self, node_id: &NodeId) -> Result<u64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(1) FROM node_dependents WHERE node_id=?1",
            params![node_id.as_str()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
