use serde_json::{json, Value};
use thiserror::Error;

use crate::session::State;

/// Pipeline errors surfaced to the caller. Per-row validation problems are
/// not errors in this sense; they are collected into the session error log.
#[derive(Debug, Clone, Error)]
pub enum ImportError {
    #[error("import session not found: {id}")]
    SessionNotFound { id: String },

    #[error("import session is terminal ({state})")]
    SessionTerminal { state: State },

    #[error("session state is {actual}, expected {expected}")]
    StateConflict { expected: State, actual: State },

    #[error("invalid column mapping: {reason}")]
    Mapping { reason: String },

    #[error("upload rejected: {reason}")]
    Parse { reason: String },

    #[error("invalid resolution: {reason}")]
    Resolution { reason: String },

    #[error("unresolved conflict rows: {missing:?}")]
    ResolutionIncomplete { missing: Vec<usize> },

    #[error("commit failed: {reason}")]
    CommitFailure { reason: String },
}

impl ImportError {
    pub fn parse(reason: impl Into<String>) -> Self {
        ImportError::Parse {
            reason: reason.into(),
        }
    }

    pub fn mapping(reason: impl Into<String>) -> Self {
        ImportError::Mapping {
            reason: reason.into(),
        }
    }

    pub fn resolution(reason: impl Into<String>) -> Self {
        ImportError::Resolution {
            reason: reason.into(),
        }
    }

    pub fn commit(reason: impl Into<String>) -> Self {
        ImportError::CommitFailure {
            reason: reason.into(),
        }
    }

    /// Stable wire code for the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::SessionNotFound { .. } => "session_not_found",
            ImportError::SessionTerminal { .. } => "session_terminal",
            ImportError::StateConflict { .. } => "state_conflict",
            ImportError::Mapping { .. } => "bad_mapping",
            ImportError::Parse { .. } => "parse_failed",
            ImportError::Resolution { .. } => "bad_resolution",
            ImportError::ResolutionIncomplete { .. } => "resolution_incomplete",
            ImportError::CommitFailure { .. } => "commit_failed",
        }
    }

    /// Structured context for the envelope's `details` field, where the
    /// message alone is not actionable.
    pub fn details(&self) -> Option<Value> {
        match self {
            ImportError::StateConflict { expected, actual } => Some(json!({
                "expected": expected.as_str(),
                "actual": actual.as_str(),
            })),
            ImportError::SessionTerminal { state } => Some(json!({ "state": state.as_str() })),
            ImportError::ResolutionIncomplete { missing } => {
                Some(json!({ "missingRows": missing }))
            }
            _ => None,
        }
    }
}
