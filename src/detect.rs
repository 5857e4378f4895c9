//! Conflict detection (import step 3).
//!
//! A pure read-and-compare pass: mapped rows against a point-in-time
//! snapshot of the stored roster. Candidates are pre-filtered by class key
//! before any name comparison so cost stays proportional to rows times
//! same-class records, never the full cross product.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::mapping::{Row, TargetField};
use crate::normalize::{name_similarity, normalize, SIMILARITY_THRESHOLD};

/// Read-only view of one stored roster record, as loaded from the
/// persistence layer. Detection never mutates these.
#[derive(Debug, Clone)]
pub struct ExistingRecord {
    pub id: String,
    pub name: String,
    pub name_key: String,
    pub class_key: String,
    pub student_no: Option<String>,
    pub birth_date: Option<String>,
    pub email: Option<String>,
}

/// Stored records grouped by class key.
pub type RosterSnapshot = HashMap<String, Vec<ExistingRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    New,
    ExactMatch,
    Ambiguous,
    Conflict,
}

impl Classification {
    pub fn is_new(self) -> bool {
        self == Classification::New
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::New => "NEW",
            Classification::ExactMatch => "EXACT_MATCH",
            Classification::Ambiguous => "AMBIGUOUS",
            Classification::Conflict => "CONFLICT",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub name: String,
    /// Name similarity in `[SIMILARITY_THRESHOLD, 1.0]`.
    pub score: f64,
    /// Secondary fields whose values disagree with the incoming row.
    /// Only meaningful for identical-name candidates.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub differing: Vec<TargetField>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub row_index: usize,
    pub line: usize,
    pub classification: Classification,
    pub candidates: Vec<Candidate>,
}

/// Classifies every row. Output order follows the input rows; candidate
/// order is score descending, record id ascending on ties, so repeated
/// runs over the same inputs are byte-for-byte identical.
pub fn detect(rows: &[Row], snapshot: &RosterSnapshot) -> Vec<ConflictEntry> {
    rows.iter().map(|row| classify(row, snapshot)).collect()
}

fn classify(row: &Row, snapshot: &RosterSnapshot) -> ConflictEntry {
    let name_key = normalize(row.get(TargetField::Name));
    let class_key = normalize(row.get(TargetField::ClassGroup));
    let empty = Vec::new();
    let pool = snapshot.get(&class_key).unwrap_or(&empty);

    let mut scored: Vec<(bool, Candidate)> = Vec::new();
    for record in pool {
        let exact = record.name_key == name_key;
        let score = if exact {
            1.0
        } else {
            name_similarity(&name_key, &record.name_key)
        };
        if score < SIMILARITY_THRESHOLD {
            continue;
        }
        let differing = if exact {
            differing_fields(row, record)
        } else {
            Vec::new()
        };
        scored.push((
            exact,
            Candidate {
                id: record.id.clone(),
                name: record.name.clone(),
                score,
                differing,
            },
        ));
    }
    scored.sort_by(|(_, a), (_, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let exact_count = scored.iter().filter(|(exact, _)| *exact).count();
    let classification = if scored.is_empty() {
        Classification::New
    } else if exact_count == 1 && scored.len() == 1 {
        if scored[0].1.differing.is_empty() {
            Classification::ExactMatch
        } else {
            Classification::Conflict
        }
    } else if exact_count >= 2 {
        // Several stored records already share this exact name; identity
        // has to be settled by the caller, field by field.
        scored.retain(|(exact, _)| *exact);
        Classification::Conflict
    } else {
        // Near-matches in play (possibly alongside one exact name):
        // the ranked list is surfaced and the caller picks.
        Classification::Ambiguous
    };

    ConflictEntry {
        row_index: row.row_index,
        line: row.line,
        classification,
        candidates: scored.into_iter().map(|(_, c)| c).collect(),
    }
}

/// Compares the secondary fields the row actually carries against a
/// stored record. Empty incoming values are not compared; a field the
/// upload doesn't know about can't disagree.
fn differing_fields(row: &Row, record: &ExistingRecord) -> Vec<TargetField> {
    let mut differing = Vec::new();
    for field in TargetField::SECONDARY {
        let incoming = row.get(field);
        if incoming.is_empty() {
            continue;
        }
        let stored = match field {
            TargetField::StudentNo => record.student_no.as_deref(),
            TargetField::BirthDate => record.birth_date.as_deref(),
            TargetField::Email => record.email.as_deref(),
            _ => None,
        }
        .unwrap_or("");
        let same = match field {
            TargetField::Email => incoming.eq_ignore_ascii_case(stored.trim()),
            _ => incoming == stored.trim(),
        };
        if !same {
            differing.push(field);
        }
    }
    differing
}
