use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{get_iso_date, get_opt_str, now_iso, require_admin};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Transaction;
use serde_json::json;
use uuid::Uuid;

/// Copy every certification dated before `before` into the backup table with
/// audit fields, then delete the originals. Runs inside the caller's
/// transaction so a failed backup insert leaves the live rows untouched.
fn backup_then_delete(
    tx: &Transaction,
    before: NaiveDate,
    track_filter: Option<&str>,
    deleted_by: &str,
    reason: Option<&str>,
) -> Result<usize, ApiError> {
    let before_s = before.format("%Y-%m-%d").to_string();
    let deleted_at = now_iso();

    let mut sql = String::from(
        "SELECT id, user_id, track_id, period_id, certification_date, url,
                notes, status, idempotency_key, created_at, updated_at
         FROM certifications WHERE certification_date < ?",
    );
    if track_filter.is_some() {
        sql.push_str(" AND track_id = ?");
    }
    let mut stmt = tx.prepare(&sql)?;
    type CertTuple = (
        String,
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        String,
        Option<String>,
        String,
        Option<String>,
    );
    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<CertTuple> {
        Ok((
            r.get(0)?,
            r.get(1)?,
            r.get(2)?,
            r.get(3)?,
            r.get(4)?,
            r.get(5)?,
            r.get(6)?,
            r.get(7)?,
            r.get(8)?,
            r.get(9)?,
            r.get(10)?,
        ))
    };
    let rows = match track_filter {
        Some(t) => stmt
            .query_map((&before_s, t), map_row)?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([&before_s], map_row)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    drop(stmt);

    for row in &rows {
        tx.execute(
            "INSERT INTO certifications_backup(
                id, original_id, user_id, track_id, period_id,
                certification_date, url, notes, status, idempotency_key,
                created_at, updated_at, deleted_by, deleted_at, delete_reason)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &row.0,
                &row.1,
                &row.2,
                &row.3,
                &row.4,
                &row.5,
                &row.6,
                &row.7,
                &row.8,
                &row.9,
                &row.10,
                deleted_by,
                &deleted_at,
                reason,
            ),
        )
        .map_err(ApiError::update)?;
    }

    let deleted = match track_filter {
        Some(t) => tx
            .execute(
                "DELETE FROM certifications WHERE certification_date < ? AND track_id = ?",
                (&before_s, t),
            )
            .map_err(ApiError::update)?,
        None => tx
            .execute(
                "DELETE FROM certifications WHERE certification_date < ?",
                [&before_s],
            )
            .map_err(ApiError::update)?,
    };
    debug_assert_eq!(deleted, rows.len());
    Ok(deleted)
}

fn bulk_delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_mut() else {
        return Err(ApiError::NoWorkspace);
    };
    let admin_id = require_admin(conn, params)?;
    let before = get_iso_date(params, "beforeDate")?;
    let track_filter = get_opt_str(params, "trackId");
    let reason = get_opt_str(params, "reason");

    let tx = conn.transaction().map_err(ApiError::tx)?;
    let deleted = backup_then_delete(
        &tx,
        before,
        track_filter.as_deref(),
        &admin_id,
        reason.as_deref(),
    )?;
    tx.commit().map_err(ApiError::tx)?;
    tracing::info!(count = deleted, before = %before, "bulk delete with backup");

    state.cache.clear();
    Ok(json!({ "backedUp": deleted, "deleted": deleted }))
}

/// Season rollover, as one atomic transaction: backup -> delete -> deactivate
/// every enrollment -> retire the active period -> open the next term. Any
/// failing step rolls the whole sequence back.
fn reset_period(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_mut() else {
        return Err(ApiError::NoWorkspace);
    };
    let admin_id = require_admin(conn, params)?;
    let before = get_iso_date(params, "beforeDate")?;
    let next_start = get_iso_date(params, "nextPeriodStart")?;
    let next_end = get_iso_date(params, "nextPeriodEnd")?;
    if next_start > next_end {
        return Err(ApiError::bad_params(
            "nextPeriodStart must not be after nextPeriodEnd",
        ));
    }
    let track_filter = get_opt_str(params, "trackId");
    let reason = get_opt_str(params, "reason");

    let tx = conn.transaction().map_err(ApiError::tx)?;

    let deleted = backup_then_delete(
        &tx,
        before,
        track_filter.as_deref(),
        &admin_id,
        reason.as_deref(),
    )?;

    let deactivated = tx
        .execute("UPDATE user_tracks SET active = 0 WHERE active = 1", [])
        .map_err(ApiError::update)?;
    tx.execute("UPDATE periods SET active = 0 WHERE active = 1", [])
        .map_err(ApiError::update)?;

    let max_term: Option<i64> =
        tx.query_row("SELECT MAX(term_number) FROM periods", [], |r| r.get(0))?;
    let term_number = max_term.unwrap_or(0) + 1;
    let period_id = Uuid::new_v4().to_string();
    let start_s = next_start.format("%Y-%m-%d").to_string();
    let end_s = next_end.format("%Y-%m-%d").to_string();
    tx.execute(
        "INSERT INTO periods(id, term_number, start_date, end_date, active)
         VALUES(?, ?, ?, ?, 1)",
        (&period_id, term_number, &start_s, &end_s),
    )
    .map_err(ApiError::update)?;

    tx.commit().map_err(ApiError::tx)?;
    tracing::info!(
        term = term_number,
        backed_up = deleted,
        enrollments = deactivated,
        "period reset complete"
    );

    state.cache.clear();
    Ok(json!({
        "backedUp": deleted,
        "deleted": deleted,
        "enrollmentsDeactivated": deactivated,
        "newPeriod": {
            "id": period_id,
            "termNumber": term_number,
            "startDate": start_s,
            "endDate": end_s,
            "active": true,
        }
    }))
}

fn list_backups(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let _admin = require_admin(conn, params)?;
    let mut stmt = conn.prepare(
        "SELECT id, original_id, user_id, track_id, period_id, certification_date,
                url, status, deleted_by, deleted_at, delete_reason
         FROM certifications_backup
         ORDER BY deleted_at DESC, certification_date DESC",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "originalId": r.get::<_, String>(1)?,
                "userId": r.get::<_, String>(2)?,
                "trackId": r.get::<_, String>(3)?,
                "periodId": r.get::<_, String>(4)?,
                "certificationDate": r.get::<_, String>(5)?,
                "url": r.get::<_, String>(6)?,
                "status": r.get::<_, String>(7)?,
                "deletedBy": r.get::<_, String>(8)?,
                "deletedAt": r.get::<_, String>(9)?,
                "deleteReason": r.get::<_, Option<String>>(10)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "backups": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "admin.bulkDeleteCertifications" => bulk_delete(state, &req.params),
        "admin.resetPeriod" => reset_period(state, &req.params),
        "admin.listBackups" => list_backups(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
