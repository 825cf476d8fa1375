#![forbid(unsafe_code)]

use crate::batch::StagedOp;
use crate::ids::HierarchyTag;
use crate::report::CycleDetected;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("cycle detected in hierarchy {tag} ({} cycle(s))", .cycles.len())]
    CycleDetected {
        tag: HierarchyTag,
        cycles: Vec<CycleDetected>,
    },
    #[error("reconciliation busy (holder={holder}, expires_at_ms={expires_at_ms})")]
    ReconciliationBusy { holder: String, expires_at_ms: i64 },
    #[error("batch partially applied ({} applied, {} pending): {message}", .applied.len(), .pending.len())]
    PartialFailure {
        applied: Vec<StagedOp>,
        pending: Vec<StagedOp>,
        message: String,
    },
    #[error("pass cancelled before commit")]
    Cancelled,
    #[error("invalid rule: {0}")]
    InvalidRule(&'static str),
}

impl EngineError {
    /// Stable code for reports and history rows.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::ReconciliationBusy { .. } => "RECONCILIATION_BUSY",
            Self::PartialFailure { .. } => "PARTIAL_FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::InvalidRule(_) => "INVALID_RULE",
        }
    }

    /// Whether re-running the same pass later is expected to help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::ReconciliationBusy { .. }
                | Self::PartialFailure { .. }
                | Self::Cancelled
        )
    }
}

impl From<crate::boundary::BoundaryError> for EngineError {
    fn from(value: crate::boundary::BoundaryError) -> Self {
        match value {
            crate::boundary::BoundaryError::Unavailable(message) => Self::StoreUnavailable(message),
        }
    }
}
