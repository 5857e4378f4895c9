use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::detect::ConflictEntry;
use crate::error::ImportError;
use crate::mapping::{ColumnMapping, Row, TargetField};

/// Import pipeline step. Sessions only move forward:
/// `UPLOADED → MAPPED → CONFLICTS_DETECTED → RESOLVED → IMPORTED`, with
/// `FAILED` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uploaded,
    Mapped,
    ConflictsDetected,
    Resolved,
    Imported,
    Failed,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Uploaded => "UPLOADED",
            State::Mapped => "MAPPED",
            State::ConflictsDetected => "CONFLICTS_DETECTED",
            State::Resolved => "RESOLVED",
            State::Imported => "IMPORTED",
            State::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Imported | State::Failed)
    }

    pub fn allows(self, next: State) -> bool {
        use State::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Uploaded, Mapped)
                | (Mapped, ConflictsDetected)
                | (ConflictsDetected, Resolved)
                | (Resolved, Imported)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One positional data line exactly as parsed, before any mapping.
#[derive(Debug, Clone)]
pub struct RawRow {
    /// 1-based line number in the uploaded file.
    pub line: usize,
    pub cells: Vec<String>,
}

/// One collected validation problem. Never aborts the batch on its own;
/// the whole log is returned so a caller can fix a file in one pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub reason: String,
}

impl Issue {
    pub fn line(line: usize, reason: impl Into<String>) -> Self {
        Issue {
            line: Some(line),
            field: None,
            reason: reason.into(),
        }
    }

    pub fn field(line: usize, field: TargetField, reason: impl Into<String>) -> Self {
        Issue {
            line: Some(line),
            field: Some(field.as_str().to_string()),
            reason: reason.into(),
        }
    }

    pub fn general(reason: impl Into<String>) -> Self {
        Issue {
            line: None,
            field: None,
            reason: reason.into(),
        }
    }
}

/// Caller decision for one conflicted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionChoice {
    CreateNew,
    MergeWith(String),
    Skip,
}

impl ResolutionChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionChoice::CreateNew => "create_new",
            ResolutionChoice::MergeWith(_) => "merge_with",
            ResolutionChoice::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome {
    pub row_index: usize,
    pub line: usize,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub created: usize,
    pub merged: usize,
    pub skipped: usize,
    pub details: Vec<RowOutcome>,
}

/// One in-flight import. Owned by the session store and mutated only
/// through its `transition` entry point; handlers see clones.
#[derive(Debug, Clone)]
pub struct ImportSession {
    pub id: String,
    pub owner: String,
    pub state: State,
    pub created_at: DateTime<Utc>,
    pub expires_at: Instant,
    pub filename: Option<String>,
    pub headers: Vec<String>,
    pub raw_rows: Vec<RawRow>,
    pub mapping: Option<ColumnMapping>,
    /// Rows that survived step-2 validation, in raw-row order.
    pub rows: Vec<Row>,
    pub conflicts: Vec<ConflictEntry>,
    pub resolutions: BTreeMap<usize, ResolutionChoice>,
    pub error_log: Vec<Issue>,
    /// State the session held when it failed, kept for diagnosis.
    pub failed_from: Option<State>,
    pub result: Option<CommitOutcome>,
}

impl ImportSession {
    pub fn new(
        owner: impl Into<String>,
        filename: Option<String>,
        headers: Vec<String>,
        raw_rows: Vec<RawRow>,
        issues: Vec<Issue>,
        ttl: Duration,
    ) -> Self {
        ImportSession {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            state: State::Uploaded,
            created_at: Utc::now(),
            expires_at: Instant::now() + ttl,
            filename,
            headers,
            raw_rows,
            mapping: None,
            rows: Vec::new(),
            conflicts: Vec::new(),
            resolutions: BTreeMap::new(),
            error_log: issues,
            failed_from: None,
            result: None,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Installs the caller's resolutions, checking the batch as a whole:
    /// every referenced row must have a conflict entry, merge targets must
    /// be detected candidates, and every non-NEW entry must end up covered.
    pub fn apply_resolutions(
        &mut self,
        incoming: BTreeMap<usize, ResolutionChoice>,
    ) -> Result<(), ImportError> {
        for (&row_index, choice) in &incoming {
            let Some(entry) = self.conflicts.iter().find(|e| e.row_index == row_index) else {
                return Err(ImportError::resolution(format!(
                    "row {row_index} has no conflict entry"
                )));
            };
            match choice {
                ResolutionChoice::MergeWith(id) => {
                    if entry.candidates.iter().all(|c| c.id != *id) {
                        return Err(ImportError::resolution(format!(
                            "record '{id}' is not a candidate for row {row_index}"
                        )));
                    }
                }
                ResolutionChoice::CreateNew | ResolutionChoice::Skip => {}
            }
        }

        let missing: Vec<usize> = self
            .conflicts
            .iter()
            .filter(|e| !e.classification.is_new() && !incoming.contains_key(&e.row_index))
            .map(|e| e.row_index)
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::ResolutionIncomplete { missing });
        }

        self.resolutions = incoming;
        Ok(())
    }
}
