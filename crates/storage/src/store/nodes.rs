#![forbid(unsafe_code)]

use super::*;
use rusqlite::{OptionalExtension, Transaction, params};
use tk_core::{HierarchyNode, HierarchyTag, NodeCreate, NodeId};

type NodeRow = (String, String, String, Option<String>, Option<String>);

fn read_node_row(row: &rusqlite::Row<'_>) -> Result<NodeRow, rusqlite::Error> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn node_from_row((id, tag, name, parent_id, code): NodeRow) -> Result<HierarchyNode, StoreError> {
    let id = NodeId::try_new(id).map_err(|_| StoreError::InvalidInput("invalid node row id"))?;
    let tag =
        HierarchyTag::try_new(tag).map_err(|_| StoreError::InvalidInput("invalid node row tag"))?;
    let parent_id = parent_id
        .map(NodeId::try_new)
        .transpose()
        .map_err(|_| StoreError::InvalidInput("invalid node row parent"))?;
    Ok(HierarchyNode {
        id,
        tag,
        name,
        parent_id,
        code,
    })
}

impl SqliteStore {
    /// Inserts or replaces a node. Parents are not checked; dangling and
    /// cyclic links are the engine's to report.
    pub fn node_upsert(&mut self, node: &HierarchyNode) -> Result<(), StoreError> {
        let now_ms = self.now_ms();
        let tx = self.conn.transaction()?;
        node_upsert_tx(&tx, node, now_ms)?;
        tx.commit()?;
        Ok(())
    }

    pub fn node_get(&self, id: &NodeId) -> Result<Option<HierarchyNode>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, tag, name, parent_id, code FROM hierarchy_nodes WHERE id=?1",
                params![id.as_str()],
                read_node_row,
            )
            .optional()?;
        row.map(node_from_row).transpose()
    }

    /// Returns whether a node was removed.
    pub fn node_delete(&mut self, id: &NodeId) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = node_delete_tx(&tx, id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Every node of one hierarchy, ordered by id.
    pub fn nodes_list(&self, tag: &HierarchyTag) -> Result<Vec<HierarchyNode>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tag, name, parent_id, code FROM hierarchy_nodes \
             WHERE tag=?1 \
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![tag.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(node_from_row(read_node_row(row)?)?);
        }
        Ok(out)
    }
}

pub(super) fn node_upsert_tx(
    tx: &Transaction<'_>,
    node: &HierarchyNode,
    now_ms: i64,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO hierarchy_nodes(id, tag, name, parent_id, code, created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ON CONFLICT(id) DO UPDATE SET
          tag=excluded.tag,
          name=excluded.name,
          parent_id=excluded.parent_id,
          code=excluded.code,
          updated_at_ms=excluded.updated_at_ms
        "#,
        params![
            node.id.as_str(),
            node.tag.as_str(),
            node.name.as_str(),
            node.parent_id.as_ref().map(NodeId::as_str),
            node.code.as_deref(),
            now_ms,
        ],
    )?;
    Ok(())
}

/// A create whose id already exists is left alone, so a retried batch does
/// not duplicate or overwrite nodes.
pub(super) fn node_create_tx(
    tx: &Transaction<'_>,
    create: &NodeCreate,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let inserted = tx.execute(
        r#"
        INSERT INTO hierarchy_nodes(id, tag, name, parent_id, code, created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ON CONFLICT(id) DO NOTHING
        "#,
        params![
            create.id.as_str(),
            create.tag.as_str(),
            create.name.as_str(),
            create.parent_id.as_ref().map(NodeId::as_str),
            create.code.as_deref(),
            now_ms,
        ],
    )?;
    Ok(inserted > 0)
}

pub(super) fn node_delete_tx(tx: &Transaction<'_>, id: &NodeId) -> Result<bool, StoreError> {
    let removed = tx.execute(
        "DELETE FROM hierarchy_nodes WHERE id=?1",
        params![id.as_str()],
    )?;
    Ok(removed > 0)
}
