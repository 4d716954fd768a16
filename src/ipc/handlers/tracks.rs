use crate::ipc::cache::{track_tag, user_tag, view_tag};
use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{get_uuid, load_track, now_iso, user_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn list(state: &mut AppState, _params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    // Correlated subquery keeps the count per track without join fan-out.
    let mut stmt = conn.prepare(
        "SELECT
           t.id,
           t.name,
           t.cadence,
           t.active,
           (SELECT COUNT(*) FROM user_tracks ut
            WHERE ut.track_id = t.id AND ut.active = 1) AS enrolled_count
         FROM tracks t
         WHERE t.active = 1
         ORDER BY t.name",
    )?;
    let tracks = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "cadence": r.get::<_, String>(2)?,
                "active": r.get::<_, i64>(3)? != 0,
                "enrolledCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "tracks": tracks }))
}

/// Enrollment rows are never hard-deleted; re-enrolling flips the existing
/// row back on, keeping its warning history.
fn enroll(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let user_id = get_uuid(params, "userId")?;
    let track_id = get_uuid(params, "trackId")?;
    if !user_exists(conn, &user_id)? {
        return Err(ApiError::NotFound("user"));
    }
    let track = load_track(conn, &track_id)?;
    if !track.active {
        return Err(ApiError::bad_params("track is not active"));
    }

    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT id, active FROM user_tracks WHERE user_id = ? AND track_id = ?",
            (&user_id, &track_id),
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
        )
        .optional()?;

    let (enrollment_id, already_active) = match existing {
        Some((id, active)) => {
            if active == 0 {
                conn.execute("UPDATE user_tracks SET active = 1 WHERE id = ?", [&id])
                    .map_err(ApiError::update)?;
            }
            (id, active != 0)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO user_tracks(id, user_id, track_id, active, warning_count, created_at)
                 VALUES(?, ?, ?, 1, 0, ?)",
                (&id, &user_id, &track_id, now_iso()),
            )
            .map_err(ApiError::update)?;
            (id, false)
        }
    };

    state.cache.invalidate_tags(&[
        user_tag(&user_id),
        track_tag(&track_id),
        view_tag("dashboard"),
        view_tag("tracking"),
    ]);
    Ok(json!({
        "enrollmentId": enrollment_id,
        "alreadyEnrolled": already_active,
    }))
}

fn leave(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let user_id = get_uuid(params, "userId")?;
    let track_id = get_uuid(params, "trackId")?;
    let changed = conn
        .execute(
            "UPDATE user_tracks SET active = 0
             WHERE user_id = ? AND track_id = ? AND active = 1",
            (&user_id, &track_id),
        )
        .map_err(ApiError::update)?;
    if changed == 0 {
        return Err(ApiError::NotFound("enrollment"));
    }
    state.cache.invalidate_tags(&[
        user_tag(&user_id),
        track_tag(&track_id),
        view_tag("dashboard"),
        view_tag("tracking"),
    ]);
    Ok(json!({ "left": true }))
}

fn enrollments(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let user_id = get_uuid(params, "userId")?;
    let mut stmt = conn.prepare(
        "SELECT ut.id, ut.track_id, t.name, t.cadence, ut.warning_count, ut.created_at
         FROM user_tracks ut
         JOIN tracks t ON t.id = ut.track_id
         WHERE ut.user_id = ? AND ut.active = 1
         ORDER BY t.name",
    )?;
    let rows = stmt
        .query_map([&user_id], |r| {
            Ok(json!({
                "enrollmentId": r.get::<_, String>(0)?,
                "trackId": r.get::<_, String>(1)?,
                "trackName": r.get::<_, String>(2)?,
                "cadence": r.get::<_, String>(3)?,
                "warningCount": r.get::<_, i64>(4)?,
                "enrolledAt": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "enrollments": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "tracks.list" => list(state, &req.params),
        "tracks.enroll" => enroll(state, &req.params),
        "tracks.leave" => leave(state, &req.params),
        "tracks.enrollments" => enrollments(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
