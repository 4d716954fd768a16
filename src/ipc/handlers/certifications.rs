use crate::ipc::cache::{self, write_tags};
use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{
    active_period, cert_rows_for, get_opt_str, get_required_i32, get_required_str,
    get_required_u32, get_uuid, load_track, now_iso, require_admin, user_exists, validate_url,
};
use crate::ipc::types::{AppState, Request};
use crate::db;
use crate::schedule;
use rusqlite::types::Value;
use std::collections::BTreeMap;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn cert_json_row(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "trackId": r.get::<_, String>(2)?,
        "periodId": r.get::<_, String>(3)?,
        "certificationDate": r.get::<_, String>(4)?,
        "url": r.get::<_, String>(5)?,
        "notes": r.get::<_, Option<String>>(6)?,
        "status": r.get::<_, String>(7)?,
        "idempotencyKey": r.get::<_, Option<String>>(8)?,
        "createdAt": r.get::<_, String>(9)?,
        "updatedAt": r.get::<_, Option<String>>(10)?,
    }))
}

const CERT_COLUMNS: &str = "id, user_id, track_id, period_id, certification_date, url, notes,
     status, idempotency_key, created_at, updated_at";

fn load_cert(conn: &Connection, id: &str) -> Result<serde_json::Value, ApiError> {
    conn.query_row(
        &format!("SELECT {} FROM certifications WHERE id = ?", CERT_COLUMNS),
        [id],
        cert_json_row,
    )
    .optional()?
    .ok_or(ApiError::NotFound("certification"))
}

/// Validate -> idempotency replay -> upsert on (user, track, date) -> cache
/// invalidation. Replay is success-with-flag, never an error; a concurrent
/// duplicate without a key resolves through the unique constraint
/// (last-write-wins).
fn submit(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let today = state.clock.today();

    let user_id = get_uuid(params, "userId")?;
    let track_id = get_uuid(params, "trackId")?;
    let date_s = get_required_str(params, "certificationDate")?;
    let date = schedule::normalize_date_str(&date_s)
        .ok_or_else(|| ApiError::bad_params("certificationDate must be YYYY-MM-DD"))?;
    let url = get_required_str(params, "url")?;
    validate_url(&url)?;
    let notes = get_opt_str(params, "notes");
    let idempotency_key = get_opt_str(params, "idempotencyKey").filter(|k| !k.trim().is_empty());

    if !user_exists(conn, &user_id)? {
        return Err(ApiError::NotFound("user"));
    }
    let track = load_track(conn, &track_id)?;
    if !track.active {
        return Err(ApiError::bad_params("track is not active"));
    }

    let period = active_period(conn)?.ok_or(ApiError::NotFound("active period"))?;
    if let Some(requested) = get_opt_str(params, "periodId") {
        if requested != period.id {
            return Err(ApiError::bad_params("periodId is not the active period"));
        }
    }
    if date < period.start_date || date > period.end_date {
        return Err(ApiError::bad_params(
            "certificationDate is outside the active period",
        ));
    }
    if date > today {
        return Err(ApiError::bad_params("certificationDate is in the future"));
    }

    if let Some(key) = idempotency_key.as_deref() {
        let prior: Option<(String, String)> = conn
            .query_row(
                "SELECT id, user_id FROM certifications WHERE idempotency_key = ?",
                [key],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?;
        if let Some((prior_id, prior_user)) = prior {
            if prior_user != user_id {
                return Err(ApiError::bad_params(
                    "idempotencyKey was already used by another account",
                ));
            }
            tracing::debug!(key, "idempotent replay, returning prior record");
            return Ok(json!({
                "certification": load_cert(conn, &prior_id)?,
                "alreadyApplied": true,
            }));
        }
    }

    let now = now_iso();
    let date_db = date.format("%Y-%m-%d").to_string();
    conn.execute(
        "INSERT INTO certifications(
            id, user_id, track_id, period_id, certification_date, url, notes,
            status, idempotency_key, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'submitted', ?, ?, NULL)
         ON CONFLICT(user_id, track_id, certification_date) DO UPDATE SET
           url = excluded.url,
           notes = excluded.notes,
           status = 'submitted',
           idempotency_key = excluded.idempotency_key,
           updated_at = ?",
        (
            Uuid::new_v4().to_string(),
            &user_id,
            &track_id,
            &period.id,
            &date_db,
            url.trim(),
            &notes,
            &idempotency_key,
            &now,
            &now,
        ),
    )
    .map_err(ApiError::update)?;

    let id: String = conn.query_row(
        "SELECT id FROM certifications
         WHERE user_id = ? AND track_id = ? AND certification_date = ?",
        (&user_id, &track_id, &date_db),
        |r| r.get(0),
    )?;
    tracing::info!(user = %user_id, track = %track.name, date = %date_db, "certification submitted");

    let certification = load_cert(conn, &id)?;
    state
        .cache
        .invalidate_tags(&write_tags(&user_id, &track_id, &period.id));
    Ok(json!({
        "certification": certification,
        "alreadyApplied": false,
    }))
}

/// Participants see their own rows; admins may filter freely.
fn list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let requester = get_uuid(params, "requesterId")?;
    let requester_is_admin = db::is_admin(conn, &requester)?;

    let user_filter = match get_opt_str(params, "userId") {
        Some(u) => Some(parse_scoped_user(&u, &requester, requester_is_admin)?),
        None if requester_is_admin => None,
        None => Some(requester.clone()),
    };

    let mut sql = format!(
        "SELECT {} FROM certifications WHERE 1 = 1",
        CERT_COLUMNS
    );
    let mut args: Vec<Value> = Vec::new();
    if let Some(u) = user_filter {
        sql.push_str(" AND user_id = ?");
        args.push(Value::Text(u));
    }
    if let Some(t) = get_opt_str(params, "trackId") {
        sql.push_str(" AND track_id = ?");
        args.push(Value::Text(t));
    }
    if let Some(p) = get_opt_str(params, "periodId") {
        sql.push_str(" AND period_id = ?");
        args.push(Value::Text(p));
    }
    sql.push_str(" ORDER BY certification_date DESC, created_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), cert_json_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "certifications": rows }))
}

fn parse_scoped_user(
    requested: &str,
    requester: &str,
    requester_is_admin: bool,
) -> Result<String, ApiError> {
    if requested != requester && !requester_is_admin {
        return Err(ApiError::Forbidden);
    }
    Ok(requested.to_string())
}

/// Month calendar for one (user, track): required dates, per-date status,
/// summary. Served through the view cache; "today" is part of the key so a
/// stale yesterday-entry can never leak across midnight.
fn calendar(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let today = state.clock.today();

    let user_id = get_uuid(params, "userId")?;
    let track_id = get_uuid(params, "trackId")?;
    let year = get_required_i32(params, "year")?;
    let month = get_required_u32(params, "month")?;
    if !(1..=12).contains(&month) {
        return Err(ApiError::bad_params("month must be between 1 and 12"));
    }

    let cache_key = format!(
        "calendar:{}:{}:{}-{:02}:{}",
        user_id, track_id, year, month, today
    );
    if let Some(hit) = state.cache.get(&cache_key) {
        return Ok(hit);
    }

    let track = load_track(conn, &track_id)?;
    let period = active_period(conn)?;

    // None = the month lies wholly outside the active period; an empty
    // calendar, not an error.
    let window = schedule::month_window(year, month, period.as_ref().map(|p| p.bounds()));
    let (required, statuses) = match window {
        Some((lo, hi)) => {
            let required = schedule::required_dates(track.cadence, lo, hi);
            let rows = cert_rows_for(conn, &user_id, &track_id, lo, hi)?;
            let statuses = schedule::classify(&required, &rows, today);
            (required, statuses)
        }
        None => (Vec::new(), BTreeMap::new()),
    };
    let summary = schedule::summarize(&statuses, today);

    let statuses_json: serde_json::Map<String, serde_json::Value> = statuses
        .iter()
        .map(|(d, s)| {
            (
                d.format("%Y-%m-%d").to_string(),
                serde_json::to_value(s).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    let result = json!({
        "trackId": track.id,
        "cadence": track.cadence.as_db(),
        "year": year,
        "month": month,
        "requiredDates": required
            .iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect::<Vec<_>>(),
        "statuses": statuses_json,
        "summary": serde_json::to_value(summary).unwrap_or(serde_json::Value::Null),
    });

    let mut tags = vec![
        cache::user_tag(&user_id),
        cache::track_tag(&track_id),
        cache::view_tag("calendar"),
    ];
    if let Some(p) = &period {
        tags.push(cache::period_tag(&p.id));
    }
    state.cache.put(cache_key, tags, result.clone());
    Ok(result)
}

/// Admin moderation: approve or reject a submitted row.
fn review(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let _admin = require_admin(conn, params)?;
    let cert_id = get_uuid(params, "certificationId")?;
    let status = get_required_str(params, "status")?;
    if !matches!(status.as_str(), "approved" | "rejected") {
        return Err(ApiError::bad_params("status must be approved or rejected"));
    }

    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT user_id, track_id, period_id FROM certifications WHERE id = ?",
            [&cert_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((user_id, track_id, period_id)) = row else {
        return Err(ApiError::NotFound("certification"));
    };

    conn.execute(
        "UPDATE certifications SET status = ?, updated_at = ? WHERE id = ?",
        (&status, now_iso(), &cert_id),
    )
    .map_err(ApiError::update)?;
    tracing::info!(cert = %cert_id, %status, "certification reviewed");

    let certification = load_cert(conn, &cert_id)?;
    state
        .cache
        .invalidate_tags(&write_tags(&user_id, &track_id, &period_id));
    Ok(json!({ "certification": certification }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "certifications.submit" => submit(state, &req.params),
        "certifications.list" => list(state, &req.params),
        "certifications.calendar" => calendar(state, &req.params),
        "certifications.review" => review(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
