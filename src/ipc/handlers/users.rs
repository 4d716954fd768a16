use crate::db;
use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{get_opt_str, get_required_str, get_uuid, now_iso, require_admin};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn user_json(conn: &Connection, user_id: &str) -> Result<serde_json::Value, ApiError> {
    let row = conn
        .query_row(
            "SELECT id, email, name, avatar_url, created_at, updated_at
             FROM users WHERE id = ?",
            [user_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "email": r.get::<_, String>(1)?,
                    "name": r.get::<_, String>(2)?,
                    "avatarUrl": r.get::<_, Option<String>>(3)?,
                    "createdAt": r.get::<_, String>(4)?,
                    "updatedAt": r.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional()?;
    row.ok_or(ApiError::NotFound("user"))
}

/// Post-OAuth profile sync: upsert on email. The very first account in a
/// fresh workspace becomes the operator admin so the admin surface is
/// reachable at all; later grants go through users.grantAdmin.
fn sync_profile(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };

    let email = get_required_str(params, "email")?.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::bad_params("email must be a valid address"));
    }
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_params("name must not be empty"));
    }
    let avatar_url = get_opt_str(params, "avatarUrl");

    let first_account: bool = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get::<_, i64>(0))?
        == 0;

    let now = now_iso();
    conn.execute(
        "INSERT INTO users(id, email, name, avatar_url, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, NULL)
         ON CONFLICT(email) DO UPDATE SET
           name = excluded.name,
           avatar_url = excluded.avatar_url,
           updated_at = ?",
        (
            Uuid::new_v4().to_string(),
            &email,
            &name,
            &avatar_url,
            &now,
            &now,
        ),
    )
    .map_err(ApiError::update)?;

    let user_id: String = conn.query_row(
        "SELECT id FROM users WHERE email = ?",
        [&email],
        |r| r.get(0),
    )?;

    if first_account {
        conn.execute(
            "INSERT INTO admin_users(user_id, granted_at) VALUES(?, ?)
             ON CONFLICT(user_id) DO NOTHING",
            (&user_id, &now),
        )
        .map_err(ApiError::update)?;
        tracing::info!(%email, "bootstrapped first account as admin");
    }

    let user = user_json(conn, &user_id)?;
    let is_admin = db::is_admin(conn, &user_id)?;
    Ok(json!({ "user": user, "isAdmin": is_admin }))
}

fn get_user(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let user_id = get_uuid(params, "userId")?;
    let user = user_json(conn, &user_id)?;
    let is_admin = db::is_admin(conn, &user_id)?;
    Ok(json!({ "user": user, "isAdmin": is_admin }))
}

fn grant_admin(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let granted_by = require_admin(conn, params)?;
    let target = get_uuid(params, "targetUserId")?;
    let _ = user_json(conn, &target)?;
    conn.execute(
        "INSERT INTO admin_users(user_id, granted_at) VALUES(?, ?)
         ON CONFLICT(user_id) DO NOTHING",
        (&target, now_iso()),
    )
    .map_err(ApiError::update)?;
    tracing::info!(target = %target, by = %granted_by, "admin granted");
    Ok(json!({ "userId": target, "isAdmin": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "users.syncProfile" => sync_profile(state, &req.params),
        "users.get" => get_user(state, &req.params),
        "users.grantAdmin" => grant_admin(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
