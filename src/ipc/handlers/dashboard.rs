use crate::ipc::cache;
use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{
    active_period, cert_rows_for, get_required_i32, get_required_u32, get_uuid, user_exists,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, Cadence};
use serde_json::json;
use std::collections::BTreeMap;

/// Participant home view: one card per active enrollment with the month's
/// statuses, summary, and the drop warning for the trailing window.
fn open(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let today = state.clock.today();

    let user_id = get_uuid(params, "userId")?;
    let year = get_required_i32(params, "year")?;
    let month = get_required_u32(params, "month")?;
    if !(1..=12).contains(&month) {
        return Err(ApiError::bad_params("month must be between 1 and 12"));
    }
    if !user_exists(conn, &user_id)? {
        return Err(ApiError::NotFound("user"));
    }

    let cache_key = format!("dashboard:{}:{}-{:02}:{}", user_id, year, month, today);
    if let Some(hit) = state.cache.get(&cache_key) {
        return Ok(hit);
    }

    let period = active_period(conn)?;
    let window = schedule::month_window(year, month, period.as_ref().map(|p| p.bounds()));

    let mut stmt = conn.prepare(
        "SELECT ut.track_id, t.name, t.cadence, ut.warning_count
         FROM user_tracks ut
         JOIN tracks t ON t.id = ut.track_id
         WHERE ut.user_id = ? AND ut.active = 1
         ORDER BY t.name",
    )?;
    let enrollments = stmt
        .query_map([&user_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cards = Vec::with_capacity(enrollments.len());
    let mut tags = vec![cache::user_tag(&user_id), cache::view_tag("dashboard")];
    if let Some(p) = &period {
        tags.push(cache::period_tag(&p.id));
    }

    for (track_id, track_name, cadence_raw, warning_count) in enrollments {
        let Some(cadence) = Cadence::from_db(&cadence_raw) else {
            tracing::warn!(track = %track_id, cadence = %cadence_raw, "skipping track with unknown cadence");
            continue;
        };
        let (required, statuses) = match window {
            Some((lo, hi)) => {
                let required = schedule::required_dates(cadence, lo, hi);
                let rows = cert_rows_for(conn, &user_id, &track_id, lo, hi)?;
                let statuses = schedule::classify(&required, &rows, today);
                (required, statuses)
            }
            None => (Vec::new(), BTreeMap::new()),
        };
        let summary = schedule::summarize(&statuses, today);
        let drop = period.as_ref().map(|p| {
            // The drop window scans live rows inside the period, not just
            // the requested month.
            let window_lo = today - chrono::Duration::days(cadence.drop_window_days() - 1);
            let lo = window_lo.max(p.start_date);
            let hi = today.min(p.end_date);
            let rows = if lo > hi {
                Ok(Vec::new())
            } else {
                cert_rows_for(conn, &user_id, &track_id, lo, hi)
            };
            rows.map(|rows| schedule::drop_check(cadence, p.bounds(), &rows, today))
        });
        let drop = match drop {
            Some(Ok(d)) => Some(d),
            Some(Err(e)) => return Err(e),
            None => None,
        };

        tags.push(cache::track_tag(&track_id));
        cards.push(json!({
            "trackId": track_id,
            "trackName": track_name,
            "cadence": cadence.as_db(),
            "warningCount": warning_count,
            "requiredDates": required
                .iter()
                .map(|d| d.format("%Y-%m-%d").to_string())
                .collect::<Vec<_>>(),
            "statuses": statuses
                .iter()
                .map(|(d, s)| {
                    (
                        d.format("%Y-%m-%d").to_string(),
                        serde_json::to_value(s).unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect::<serde_json::Map<_, _>>(),
            "summary": serde_json::to_value(summary).unwrap_or(serde_json::Value::Null),
            "dropCheck": drop
                .map(|d| serde_json::to_value(d).unwrap_or(serde_json::Value::Null)),
        }));
    }

    let result = json!({
        "userId": user_id,
        "year": year,
        "month": month,
        "activePeriod": period.as_ref().map(|p| json!({
            "id": p.id,
            "termNumber": p.term_number,
            "startDate": p.start_date.format("%Y-%m-%d").to_string(),
            "endDate": p.end_date.format("%Y-%m-%d").to_string(),
        })),
        "tracks": cards,
    });
    state.cache.put(cache_key, tags, result.clone());
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "dashboard.open" => open(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
