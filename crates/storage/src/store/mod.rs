#![forbid(unsafe_code)]

mod boundary;
mod dependents;
mod error;
mod history;
mod locks;
mod nodes;
mod references;
mod requests;

pub use error::StoreError;
pub use requests::*;

use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;
const DB_FILE_NAME: &str = "treekeeper.db";

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    /// Identifies this handle on the pass lease; two handles never share a
    /// lease even when they pass the same holder.
    session: String,
    clock_override_ms: Option<i64>,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        preflight_gate(&conn)?;
        install_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), "store opened");

        let session = format!(
            "{}:{}:{}",
            std::process::id(),
            NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            now_ms()
        );
        Ok(Self {
            conn,
            storage_dir,
            session,
            clock_override_ms: None,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Pins the clock used for lease expiry and timestamps.
    pub fn set_now_ms(&mut self, now_ms: i64) {
        self.clock_override_ms = Some(now_ms);
    }

    fn now_ms(&self) -> i64 {
        self.clock_override_ms.unwrap_or_else(now_ms)
    }
}

const REQUIRED_TABLES: [&str; 6] = [
    "store_state",
    "hierarchy_nodes",
    "cross_references",
    "node_dependents",
    "pass_locks",
    "pass_history",
];

fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tables.insert(row.get::<_, String>(0)?);
    }

    if tables.is_empty() {
        return Ok(());
    }

    let required: BTreeSet<&str> = REQUIRED_TABLES.into_iter().collect();
    if tables
        .iter()
        .any(|table| !required.contains(table.as_str()))
    {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: unsupported tables detected",
        ));
    }

    for table in required {
        if !tables.contains(table) {
            return Err(StoreError::InvalidInput(
                "RESET_REQUIRED: required table is missing",
            ));
        }
    }

    let version = conn
        .query_row(
            "SELECT schema_version FROM store_state WHERE singleton=1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    match version {
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
        None => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema state row is missing",
        )),
    }
}

fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    let now_ms = now_ms();

    // parent_id carries no foreign key: dangling parents must stay
    // representable so passes can report them.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_state (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hierarchy_nodes (
          id TEXT PRIMARY KEY,
          tag TEXT NOT NULL,
          name TEXT NOT NULL,
          parent_id TEXT,
          code TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_hierarchy_nodes_tag
          ON hierarchy_nodes(tag, id);
        CREATE INDEX IF NOT EXISTS idx_hierarchy_nodes_parent
          ON hierarchy_nodes(parent_id);

        CREATE TABLE IF NOT EXISTS cross_references (
          id TEXT PRIMARY KEY,
          scope TEXT NOT NULL,
          label TEXT NOT NULL,
          target TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cross_references_scope
          ON cross_references(scope, id);

        CREATE TABLE IF NOT EXISTS node_dependents (
          kind TEXT NOT NULL,
          id TEXT NOT NULL,
          node_id TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          PRIMARY KEY(kind, id)
        );

        CREATE INDEX IF NOT EXISTS idx_node_dependents_node
          ON node_dependents(node_id);

        CREATE TABLE IF NOT EXISTS pass_locks (
          name TEXT PRIMARY KEY,
          holder TEXT NOT NULL,
          session TEXT NOT NULL,
          acquired_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pass_history (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job TEXT NOT NULL,
          holder TEXT NOT NULL,
          outcome TEXT NOT NULL,
          code TEXT,
          created INTEGER NOT NULL,
          updated INTEGER NOT NULL,
          deleted INTEGER NOT NULL,
          report_json TEXT,
          config_digest TEXT,
          recorded_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pass_history_job
          ON pass_history(job, seq);
        "#,
    )?;

    conn.execute(
        "INSERT INTO store_state(singleton, schema_version, created_at_ms, updated_at_ms) \
         VALUES (1, ?1, ?2, ?2) \
         ON CONFLICT(singleton) DO UPDATE SET schema_version=excluded.schema_version, updated_at_ms=excluded.updated_at_ms",
        params![SCHEMA_VERSION, now_ms],
    )?;

    Ok(())
}

fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}

fn from_sqlite_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
