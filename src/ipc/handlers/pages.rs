use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{get_required_str, now_iso, require_admin};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let slug = get_required_str(params, "slug")?;
    let row = conn
        .query_row(
            "SELECT slug, title, content, updated_by, updated_at
             FROM page_contents WHERE slug = ?",
            [&slug],
            |r| {
                Ok(json!({
                    "slug": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "content": r.get::<_, String>(2)?,
                    "updatedBy": r.get::<_, Option<String>>(3)?,
                    "updatedAt": r.get::<_, Option<String>>(4)?,
                }))
            },
        )
        .optional()?;
    row.map(|page| json!({ "page": page }))
        .ok_or(ApiError::NotFound("page"))
}

fn update(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let admin_id = require_admin(conn, params)?;
    let slug = get_required_str(params, "slug")?.trim().to_string();
    if slug.is_empty() {
        return Err(ApiError::bad_params("slug must not be empty"));
    }
    let title = get_required_str(params, "title")?;
    let content = get_required_str(params, "content")?;

    conn.execute(
        "INSERT INTO page_contents(slug, title, content, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(slug) DO UPDATE SET
           title = excluded.title,
           content = excluded.content,
           updated_by = excluded.updated_by,
           updated_at = excluded.updated_at",
        (&slug, &title, &content, &admin_id, now_iso()),
    )
    .map_err(ApiError::update)?;
    tracing::info!(%slug, "page content updated");

    Ok(json!({ "slug": slug }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "pages.get" => get(state, &req.params),
        "pages.update" => update(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
