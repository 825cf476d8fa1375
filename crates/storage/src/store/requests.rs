#![forbid(unsafe_code)]

use tk_core::{BatchSummary, NodeId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependentAttachRequest {
    /// What kind of record depends on the node, e.g. `product`.
    pub kind: String,
    pub id: String,
    pub node_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependentDetachRequest {
    pub kind: String,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassLockRow {
    pub holder: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryAppendRequest {
    pub job: String,
    pub holder: String,
    /// `applied`, `unchanged`, `dry_run` or `failed`.
    pub outcome: String,
    /// Error code when the pass failed.
    pub code: Option<String>,
    pub staged: BatchSummary,
    pub report_json: Option<String>,
    pub config_digest: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryListRequest {
    pub job: Option<String>,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassHistoryRow {
    pub seq: i64,
    pub job: String,
    pub holder: String,
    pub outcome: String,
    pub code: Option<String>,
    pub staged: BatchSummary,
    pub report_json: Option<String>,
    pub config_digest: Option<String>,
    pub recorded_at_ms: i64,
}
