use crate::documents;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn load_document(conn: &Connection, where_sql: &str, key: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT id, sha256, original_name, size_bytes, stored_path, created_at
             FROM documents WHERE {} = ?",
            where_sql
        ),
        [key],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "sha256": r.get::<_, String>(1)?,
                "originalName": r.get::<_, String>(2)?,
                "sizeBytes": r.get::<_, i64>(3)?,
                "storedPath": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn documents_put(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let src = PathBuf::from(get_required_str(params, "path")?);
    let name = get_optional_str(params, "name")
        .or_else(|| {
            src.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_string())
        })
        .unwrap_or_else(|| "document".to_string());

    let stored = documents::store_file(workspace, &src).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(json!({ "path": src.to_string_lossy() }))
    })?;

    conn.execute(
        "INSERT INTO documents(id, sha256, original_name, size_bytes, stored_path, created_at)
         VALUES(?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(sha256) DO NOTHING",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            stored.sha256,
            name,
            stored.size_bytes as i64,
            stored.stored_path
        ],
    )
    .map_err(|e| HandlerErr::db_insert("documents", e))?;

    let Some(document) = load_document(conn, "sha256", &stored.sha256)? else {
        return Err(HandlerErr::new("internal", "stored document row missing"));
    };
    Ok(json!({
        "document": document,
        "deduplicated": stored.already_present
    }))
}

fn documents_get(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let document_id = get_required_str(params, "documentId")?;
    let Some(document) = load_document(conn, "id", &document_id)? else {
        return Err(HandlerErr::not_found("document not found"));
    };
    let absolute = document
        .get("storedPath")
        .and_then(|p| p.as_str())
        .map(|p| workspace.join(p));
    let exists = absolute.as_ref().is_some_and(|p| p.is_file());
    Ok(json!({
        "document": document,
        "absolutePath": absolute.map(|p| p.to_string_lossy().to_string()),
        "fileExists": exists
    }))
}

fn handle_with_workspace(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &Path, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    with_db(state, req, |conn, params| f(conn, &workspace, params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "documents.put" => Some(handle_with_workspace(state, req, documents_put)),
        "documents.get" => Some(handle_with_workspace(state, req, documents_get)),
        _ => None,
    }
}
