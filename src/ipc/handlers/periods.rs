use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{active_period, get_iso_date, require_admin};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn period_json(id: &str, term: i64, start: &str, end: &str, active: bool) -> serde_json::Value {
    json!({
        "id": id,
        "termNumber": term,
        "startDate": start,
        "endDate": end,
        "active": active,
    })
}

fn get_active(state: &mut AppState, _params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let period = active_period(conn)?.ok_or(ApiError::NotFound("active period"))?;
    Ok(json!({
        "period": period_json(
            &period.id,
            period.term_number,
            &period.start_date.format("%Y-%m-%d").to_string(),
            &period.end_date.format("%Y-%m-%d").to_string(),
            true,
        )
    }))
}

fn list(state: &mut AppState, _params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let mut stmt = conn.prepare(
        "SELECT id, term_number, start_date, end_date, active
         FROM periods ORDER BY term_number DESC",
    )?;
    let periods = stmt
        .query_map([], |r| {
            Ok(period_json(
                &r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                &r.get::<_, String>(2)?,
                &r.get::<_, String>(3)?,
                r.get::<_, i64>(4)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "periods": periods }))
}

/// Bootstrap path for the very first term. Every later period is opened by
/// the reset orchestrator, which also retires the previous one.
fn create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let _admin = require_admin(conn, params)?;
    let start = get_iso_date(params, "startDate")?;
    let end = get_iso_date(params, "endDate")?;
    if start > end {
        return Err(ApiError::bad_params("startDate must not be after endDate"));
    }
    if active_period(conn)?.is_some() {
        return Err(ApiError::bad_params(
            "an active period already exists; close it via admin.resetPeriod",
        ));
    }

    let term_number = match params.get("termNumber").and_then(|v| v.as_i64()) {
        Some(t) if t > 0 => t,
        Some(_) => return Err(ApiError::bad_params("termNumber must be positive")),
        None => {
            let max: Option<i64> =
                conn.query_row("SELECT MAX(term_number) FROM periods", [], |r| r.get(0))?;
            max.unwrap_or(0) + 1
        }
    };

    let id = Uuid::new_v4().to_string();
    let start_s = start.format("%Y-%m-%d").to_string();
    let end_s = end.format("%Y-%m-%d").to_string();
    conn.execute(
        "INSERT INTO periods(id, term_number, start_date, end_date, active)
         VALUES(?, ?, ?, ?, 1)",
        (&id, term_number, &start_s, &end_s),
    )
    .map_err(ApiError::update)?;
    tracing::info!(term = term_number, start = %start_s, end = %end_s, "period opened");

    state.cache.clear();
    Ok(json!({ "period": period_json(&id, term_number, &start_s, &end_s, true) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "periods.getActive" => get_active(state, &req.params),
        "periods.list" => list(state, &req.params),
        "periods.create" => create(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
