//! Import commit (final step).
//!
//! Applies every resolved row inside one transaction: all effects land or
//! none do. This is the only pipeline step with externally visible side
//! effects, and the only place where roster changes made since conflict
//! detection can surface. They surface as a commit failure, never as a
//! silent fix-up.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::db;
use crate::detect::ConflictEntry;
use crate::error::ImportError;
use crate::mapping::{Row, TargetField};
use crate::normalize::normalize;
use crate::session::{CommitOutcome, ImportSession, ResolutionChoice, RowOutcome};

pub fn apply(conn: &Connection, session: &ImportSession) -> Result<CommitOutcome, ImportError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| ImportError::commit(e.to_string()))?;
    match apply_rows(&tx, session) {
        Ok(outcome) => {
            tx.commit().map_err(|e| ImportError::commit(e.to_string()))?;
            tracing::info!(
                session = %session.id,
                created = outcome.created,
                merged = outcome.merged,
                skipped = outcome.skipped,
                "import committed"
            );
            Ok(outcome)
        }
        Err(e) => {
            let _ = tx.rollback();
            tracing::warn!(session = %session.id, error = %e, "import rolled back");
            Err(e)
        }
    }
}

fn apply_rows(tx: &Transaction<'_>, session: &ImportSession) -> Result<CommitOutcome, ImportError> {
    let class_ids =
        db::class_ids_by_key(tx).map_err(|e| ImportError::commit(e.to_string()))?;
    let now = Utc::now().to_rfc3339();
    let mut outcome = CommitOutcome::default();

    // Mapped rows and conflict entries are parallel sequences; detection
    // produced exactly one entry per surviving row.
    for (row, entry) in session.rows.iter().zip(&session.conflicts) {
        debug_assert_eq!(row.row_index, entry.row_index);
        let choice = match session.resolutions.get(&entry.row_index) {
            Some(choice) => choice.clone(),
            None if entry.classification.is_new() => ResolutionChoice::CreateNew,
            None => {
                return Err(ImportError::commit(format!(
                    "row {} has no resolution",
                    entry.row_index
                )))
            }
        };

        match choice {
            ResolutionChoice::Skip => {
                outcome.skipped += 1;
                outcome.details.push(RowOutcome {
                    row_index: row.row_index,
                    line: row.line,
                    action: "skipped".to_string(),
                    record_id: None,
                });
            }
            ResolutionChoice::CreateNew => {
                let id = insert_row(tx, row, entry, &class_ids, &now)?;
                outcome.created += 1;
                outcome.details.push(RowOutcome {
                    row_index: row.row_index,
                    line: row.line,
                    action: "created".to_string(),
                    record_id: Some(id),
                });
            }
            ResolutionChoice::MergeWith(target) => {
                merge_row(tx, row, session, &target, &now)?;
                outcome.merged += 1;
                outcome.details.push(RowOutcome {
                    row_index: row.row_index,
                    line: row.line,
                    action: "merged".to_string(),
                    record_id: Some(target),
                });
            }
        }
    }

    Ok(outcome)
}

fn insert_row(
    tx: &Transaction<'_>,
    row: &Row,
    entry: &ConflictEntry,
    class_ids: &std::collections::HashMap<String, String>,
    now: &str,
) -> Result<String, ImportError> {
    let class_key = normalize(row.get(TargetField::ClassGroup));
    let Some(class_id) = class_ids.get(&class_key) else {
        return Err(ImportError::commit(format!(
            "class '{}' no longer exists (line {})",
            row.get(TargetField::ClassGroup),
            row.line
        )));
    };

    let name = row.get(TargetField::Name);
    let name_key = normalize(name);
    let student_no = optional(row.get(TargetField::StudentNo));

    // Staleness guard: a record matching this row that was NOT among the
    // detected candidates must have been inserted after detection ran.
    // That is the cross-session race the detector cannot prevent.
    let known: HashSet<&str> = entry.candidates.iter().map(|c| c.id.as_str()).collect();
    let mut stmt = tx
        .prepare(
            "SELECT id FROM students
             WHERE class_id = ?
               AND (name_key = ? OR (student_no IS NOT NULL AND student_no = ?))",
        )
        .map_err(|e| ImportError::commit(e.to_string()))?;
    let hits = stmt
        .query_map(
            (class_id, &name_key, student_no.as_deref().unwrap_or("")),
            |r| r.get::<_, String>(0),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ImportError::commit(e.to_string()))?;
    if let Some(raced) = hits.iter().find(|id| !known.contains(id.as_str())) {
        return Err(ImportError::commit(format!(
            "line {} collides with record '{raced}' that conflict detection did not see",
            row.line
        )));
    }

    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO students(id, class_id, name, name_key, student_no, birth_date, email, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            class_id,
            name,
            &name_key,
            &student_no,
            &optional(row.get(TargetField::BirthDate)),
            &optional(row.get(TargetField::Email)),
            now,
            now,
        ),
    )
    .map_err(|e| {
        ImportError::commit(format!("insert failed for line {}: {e}", row.line))
    })?;
    Ok(id)
}

/// Overwrites only the fields present in the session's column mapping;
/// everything else on the stored record is left untouched.
fn merge_row(
    tx: &Transaction<'_>,
    row: &Row,
    session: &ImportSession,
    target: &str,
    now: &str,
) -> Result<(), ImportError> {
    let exists: Option<String> = tx
        .query_row("SELECT id FROM students WHERE id = ?", [target], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| ImportError::commit(e.to_string()))?;
    if exists.is_none() {
        return Err(ImportError::commit(format!(
            "merge target '{target}' no longer exists (line {})",
            row.line
        )));
    }

    let mapping = session
        .mapping
        .as_ref()
        .ok_or_else(|| ImportError::commit("session has no column mapping"))?;

    let mut sets = Vec::new();
    let mut params: Vec<Value> = Vec::new();
    for field in mapping.fields() {
        match field {
            TargetField::Name => {
                let name = row.get(TargetField::Name);
                sets.push("name = ?");
                params.push(Value::Text(name.to_string()));
                sets.push("name_key = ?");
                params.push(Value::Text(normalize(name)));
            }
            TargetField::StudentNo => {
                sets.push("student_no = ?");
                params.push(text_or_null(row.get(TargetField::StudentNo)));
            }
            TargetField::BirthDate => {
                sets.push("birth_date = ?");
                params.push(text_or_null(row.get(TargetField::BirthDate)));
            }
            TargetField::Email => {
                sets.push("email = ?");
                params.push(text_or_null(row.get(TargetField::Email)));
            }
            // Candidates are scoped to the row's class; merging never
            // moves a record between classes.
            TargetField::ClassGroup => {}
        }
    }
    sets.push("updated_at = ?");
    params.push(Value::Text(now.to_string()));
    params.push(Value::Text(target.to_string()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    tx.execute(&sql, params_from_iter(params)).map_err(|e| {
        ImportError::commit(format!("update failed for line {}: {e}", row.line))
    })?;
    Ok(())
}

fn optional(value: &str) -> Option<String> {
    let t = value.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn text_or_null(value: &str) -> Value {
    match optional(value) {
        Some(v) => Value::Text(v),
        None => Value::Null,
    }
}
