//! The multi-step roster import pipeline.
//!
//! Each method is one complete request/response; the session store carries
//! the workflow across calls. Step order is enforced by the store's
//! optimistic state check, so a caller that replays or races a step gets a
//! `state_conflict` instead of a second application.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::csvio;
use crate::db;
use crate::detect;
use crate::error::ImportError;
use crate::ipc::error::{err, fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::mapping::{self, ColumnMapping, TargetField};
use crate::session::{ImportSession, Issue, ResolutionChoice, State};
use crate::{commit, store::SessionStore};

fn session_id(req: &Request) -> Result<String, Value> {
    match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(err(&req.id, "bad_params", "missing sessionId", None)),
    }
}

fn handle_import_start(state: &mut AppState, req: &Request) -> Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }

    let owner = req
        .params
        .get("owner")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("local")
        .to_string();
    let encoding = req.params.get("encoding").and_then(|v| v.as_str());

    let (bytes, filename) = if let Some(content) = req.params.get("content").and_then(|v| v.as_str())
    {
        let filename = req
            .params
            .get("filename")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        (content.as_bytes().to_vec(), filename)
    } else if let Some(path) = req.params.get("path").and_then(|v| v.as_str()) {
        match std::fs::read(path) {
            Ok(b) => (
                b,
                std::path::Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string()),
            ),
            Err(e) => {
                return err(
                    &req.id,
                    "parse_failed",
                    e.to_string(),
                    Some(json!({ "path": path })),
                )
            }
        }
    } else {
        return err(&req.id, "bad_params", "missing content or path", None);
    };

    if bytes.len() > state.config.max_upload_bytes {
        return fail(
            &req.id,
            &ImportError::parse(format!(
                "upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                state.config.max_upload_bytes
            )),
        );
    }

    let text = match csvio::decode(&bytes, encoding) {
        Ok(t) => t,
        Err(e) => return fail(&req.id, &e),
    };
    let parsed = match csvio::parse(&text, &state.config) {
        Ok(p) => p,
        Err(e) => return fail(&req.id, &e),
    };

    let preview: Vec<Vec<String>> = parsed
        .rows
        .iter()
        .take(state.config.preview_rows)
        .map(|r| r.cells.clone())
        .collect();
    let headers = parsed.headers.clone();
    let total_rows = parsed.rows.len();
    let issues = parsed.issues.clone();

    let session = ImportSession::new(
        owner,
        filename.clone(),
        parsed.headers,
        parsed.rows,
        parsed.issues,
        state.sessions.ttl(),
    );
    let sid = state.sessions.create(session);
    tracing::info!(session = %sid, rows = total_rows, file = ?filename, "import started");

    ok(
        &req.id,
        json!({
            "sessionId": sid,
            "state": State::Uploaded.as_str(),
            "filename": filename,
            "totalRows": total_rows,
            "headers": headers,
            "preview": preview,
            "issues": issues,
        }),
    )
}

fn parse_mapping_params(params: &Value) -> Result<Vec<(String, TargetField)>, ImportError> {
    let Some(obj) = params.get("mapping").and_then(|v| v.as_object()) else {
        return Err(ImportError::mapping("missing mapping object"));
    };
    if obj.is_empty() {
        return Err(ImportError::mapping("mapping object is empty"));
    }
    let mut raw = Vec::with_capacity(obj.len());
    for (source, target) in obj {
        let Some(target) = target.as_str() else {
            return Err(ImportError::mapping(format!(
                "mapping for column '{source}' must be a field name"
            )));
        };
        let Some(field) = TargetField::from_str(target) else {
            return Err(ImportError::mapping(format!(
                "unknown target field '{target}'"
            )));
        };
        raw.push((source.clone(), field));
    }
    // Serde objects iterate in insertion order; sort for a deterministic
    // mapping regardless of how the client ordered its keys.
    raw.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(raw)
}

fn handle_import_mapping(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sid = match session_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let raw_mapping = match parse_mapping_params(&req.params) {
        Ok(v) => v,
        Err(e) => return fail(&req.id, &e),
    };

    let class_keys = match db::class_keys(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let snapshot = match db::roster_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Step 2: validate the mapping and re-validate every row under it.
    let step_issues = match state.sessions.transition(&sid, State::Uploaded, |sess| {
        let mapping = ColumnMapping::validate(&raw_mapping, &sess.headers)?;
        let (rows, issues) = mapping::apply(&sess.raw_rows, &mapping, &class_keys);
        sess.mapping = Some(mapping);
        sess.rows = rows;
        sess.error_log.extend(issues.clone());
        Ok((State::Mapped, issues))
    }) {
        Ok(v) => v,
        Err(e) => return fail(&req.id, &e),
    };

    // Step 3: classify every surviving row against the roster snapshot.
    let conflicts = match state.sessions.transition(&sid, State::Mapped, |sess| {
        let conflicts = detect::detect(&sess.rows, &snapshot);
        sess.conflicts = conflicts.clone();
        Ok((State::ConflictsDetected, conflicts))
    }) {
        Ok(v) => v,
        Err(e) => return fail(&req.id, &e),
    };

    let mut summary = BTreeMap::from([
        ("NEW", 0usize),
        ("EXACT_MATCH", 0),
        ("AMBIGUOUS", 0),
        ("CONFLICT", 0),
    ]);
    for entry in &conflicts {
        *summary.entry(entry.classification.as_str()).or_insert(0) += 1;
    }
    tracing::info!(
        session = %sid,
        rows = conflicts.len(),
        conflicts = conflicts.len() - summary["NEW"],
        "conflict detection finished"
    );

    ok(
        &req.id,
        json!({
            "sessionId": sid,
            "state": State::ConflictsDetected.as_str(),
            "mappedRows": conflicts.len(),
            "issues": step_issues,
            "conflicts": conflicts,
            "summary": summary,
        }),
    )
}

fn parse_resolution_params(
    params: &Value,
) -> Result<BTreeMap<usize, ResolutionChoice>, ImportError> {
    let Some(obj) = params.get("resolutions").and_then(|v| v.as_object()) else {
        return Err(ImportError::resolution("missing resolutions object"));
    };
    let mut out = BTreeMap::new();
    for (key, value) in obj {
        let row_index: usize = key
            .parse()
            .map_err(|_| ImportError::resolution(format!("'{key}' is not a row index")))?;
        let action = value
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ImportError::resolution(format!("row {row_index} is missing an action"))
            })?;
        let choice = match action {
            "create_new" => ResolutionChoice::CreateNew,
            "skip" => ResolutionChoice::Skip,
            "merge_with" => {
                let id = value
                    .get("existingId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        ImportError::resolution(format!(
                            "row {row_index} merge_with needs an existingId"
                        ))
                    })?;
                ResolutionChoice::MergeWith(id.to_string())
            }
            other => {
                return Err(ImportError::resolution(format!(
                    "unknown action '{other}' for row {row_index}"
                )))
            }
        };
        out.insert(row_index, choice);
    }
    Ok(out)
}

fn handle_import_resolutions(state: &mut AppState, req: &Request) -> Value {
    let sid = match session_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let resolutions = match parse_resolution_params(&req.params) {
        Ok(v) => v,
        Err(e) => return fail(&req.id, &e),
    };

    let to_import = match state
        .sessions
        .transition(&sid, State::ConflictsDetected, |sess| {
            sess.apply_resolutions(resolutions)?;
            let skips = sess
                .resolutions
                .values()
                .filter(|c| **c == ResolutionChoice::Skip)
                .count();
            Ok((State::Resolved, sess.rows.len() - skips))
        }) {
        Ok(v) => v,
        Err(e) => return fail(&req.id, &e),
    };

    ok(
        &req.id,
        json!({
            "sessionId": sid,
            "state": State::Resolved.as_str(),
            "rowsToImport": to_import,
        }),
    )
}

fn handle_import_commit(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sid = match session_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // The commit runs inside the session's transition so the per-session
    // lock covers the whole write; TTL eviction cannot touch it while it
    // is in flight. A failed commit is itself a transition, to FAILED.
    let outcome = match state.sessions.transition(&sid, State::Resolved, |sess| {
        match commit::apply(conn, sess) {
            Ok(outcome) => {
                sess.result = Some(outcome.clone());
                Ok((State::Imported, Ok(outcome)))
            }
            Err(e) => {
                sess.failed_from = Some(sess.state);
                sess.error_log.push(Issue::general(e.to_string()));
                Ok((State::Failed, Err(e)))
            }
        }
    }) {
        Ok(v) => v,
        Err(e) => return fail(&req.id, &e),
    };

    match outcome {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "sessionId": sid,
                "state": State::Imported.as_str(),
                "created": outcome.created,
                "merged": outcome.merged,
                "skipped": outcome.skipped,
                "details": outcome.details,
            }),
        ),
        Err(e) => err(
            &req.id,
            e.code(),
            e.to_string(),
            Some(json!({ "sessionId": sid, "state": State::Failed.as_str() })),
        ),
    }
}

fn handle_import_status(state: &mut AppState, req: &Request) -> Value {
    let sid = match session_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let sess = match state.sessions.get(&sid) {
        Ok(v) => v,
        Err(e) => return fail(&req.id, &e),
    };

    let mut result = json!({
        "sessionId": sess.id,
        "state": sess.state.as_str(),
        "owner": sess.owner,
        "filename": sess.filename,
        "createdAt": sess.created_at.to_rfc3339(),
        "totalRows": sess.raw_rows.len(),
        "mappedRows": sess.rows.len(),
        "issues": sess.error_log,
    });
    if !matches!(sess.state, State::Uploaded | State::Mapped) {
        result["conflicts"] = json!(sess.conflicts);
    }
    if !sess.resolutions.is_empty() {
        let chosen: BTreeMap<usize, &str> = sess
            .resolutions
            .iter()
            .map(|(row, choice)| (*row, choice.as_str()))
            .collect();
        result["resolutions"] = json!(chosen);
    }
    if let Some(outcome) = &sess.result {
        result["result"] = json!(outcome);
    }
    if let Some(from) = sess.failed_from {
        result["failedFrom"] = json!(from.as_str());
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    // Opportunistic sweep: any import call may retire idle sessions.
    sweep(&state.sessions);
    match req.method.as_str() {
        "import.start" => Some(handle_import_start(state, req)),
        "import.mapping" => Some(handle_import_mapping(state, req)),
        "import.resolutions" => Some(handle_import_resolutions(state, req)),
        "import.commit" => Some(handle_import_commit(state, req)),
        "import.status" => Some(handle_import_status(state, req)),
        _ => None,
    }
}

fn sweep(sessions: &SessionStore) {
    let evicted = sessions.evict_expired();
    if evicted > 0 {
        tracing::debug!(evicted, "expired import sessions removed");
    }
}
