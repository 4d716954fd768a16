use crate::ipc::cache;
use crate::ipc::error::{respond, ApiError};
use crate::ipc::helpers::{
    active_period, cert_rows_for, get_opt_str, get_required_i32, get_required_u32, require_admin,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, Cadence};
use serde_json::json;
use std::collections::BTreeMap;

/// Admin tracking board: every active enrollment with month statuses,
/// summary, and drop-candidate flag. Recomputation raises the enrollment's
/// warning_count to the observed trailing-window miss count (never lowers it).
fn overview(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let today = state.clock.today();
    let _admin = require_admin(conn, params)?;

    let year = get_required_i32(params, "year")?;
    let month = get_required_u32(params, "month")?;
    if !(1..=12).contains(&month) {
        return Err(ApiError::bad_params("month must be between 1 and 12"));
    }
    let track_filter = get_opt_str(params, "trackId");

    let cache_key = format!(
        "tracking:{}-{:02}:{}:{}",
        year,
        month,
        track_filter.as_deref().unwrap_or("all"),
        today
    );
    if let Some(hit) = state.cache.get(&cache_key) {
        return Ok(hit);
    }

    let period = active_period(conn)?;
    let window = schedule::month_window(year, month, period.as_ref().map(|p| p.bounds()));

    let mut sql = String::from(
        "SELECT ut.id, ut.user_id, u.name, u.email, ut.track_id, t.name, t.cadence,
                ut.warning_count
         FROM user_tracks ut
         JOIN users u ON u.id = ut.user_id
         JOIN tracks t ON t.id = ut.track_id
         WHERE ut.active = 1",
    );
    if track_filter.is_some() {
        sql.push_str(" AND ut.track_id = ?");
    }
    sql.push_str(" ORDER BY t.name, u.name");

    let mut stmt = conn.prepare(&sql)?;
    type EnrollmentRow = (
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        i64,
    );
    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<EnrollmentRow> {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, String>(5)?,
            r.get::<_, String>(6)?,
            r.get::<_, i64>(7)?,
        ))
    };
    let enrollments = match &track_filter {
        Some(t) => stmt.query_map([t], map_row)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?,
    };

    let mut rows_out = Vec::with_capacity(enrollments.len());
    let mut tags = vec![cache::view_tag("tracking")];
    if let Some(p) = &period {
        tags.push(cache::period_tag(&p.id));
    }
    if let Some(t) = &track_filter {
        tags.push(cache::track_tag(t));
    }

    for (enrollment_id, user_id, user_name, email, track_id, track_name, cadence_raw, warning) in
        enrollments
    {
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

        let drop = match &period {
            Some(p) => {
                let window_lo = today - chrono::Duration::days(cadence.drop_window_days() - 1);
                let lo = window_lo.max(p.start_date);
                let hi = today.min(p.end_date);
                let rows = if lo > hi {
                    Vec::new()
                } else {
                    cert_rows_for(conn, &user_id, &track_id, lo, hi)?
                };
                Some(schedule::drop_check(cadence, p.bounds(), &rows, today))
            }
            None => None,
        };

        let mut warning_count = warning;
        if let Some(d) = &drop {
            let observed = d.window_missing as i64;
            if observed > warning_count {
                conn.execute(
                    "UPDATE user_tracks SET warning_count = ? WHERE id = ?",
                    (observed, &enrollment_id),
                )
                .map_err(ApiError::update)?;
                warning_count = observed;
            }
        }

        if !tags.contains(&cache::user_tag(&user_id)) {
            tags.push(cache::user_tag(&user_id));
        }
        rows_out.push(json!({
            "enrollmentId": enrollment_id,
            "userId": user_id,
            "userName": user_name,
            "email": email,
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
        "year": year,
        "month": month,
        "activePeriod": period.as_ref().map(|p| json!({
            "id": p.id,
            "termNumber": p.term_number,
        })),
        "rows": rows_out,
    });
    state.cache.put(cache_key, tags, result.clone());
    Ok(result)
}

/// Coarse admin dashboard numbers for the active period.
fn stats(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let Some(conn) = state.db.as_ref() else {
        return Err(ApiError::NoWorkspace);
    };
    let today = state.clock.today();
    let _admin = require_admin(conn, params)?;

    let period = active_period(conn)?.ok_or(ApiError::NotFound("active period"))?;

    let participant_count: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT user_id) FROM user_tracks WHERE active = 1",
        [],
        |r| r.get(0),
    )?;
    let submission_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM certifications WHERE period_id = ?",
        [&period.id],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.cadence,
                (SELECT COUNT(*) FROM user_tracks ut
                 WHERE ut.track_id = t.id AND ut.active = 1),
                (SELECT COUNT(*) FROM certifications c
                 WHERE c.track_id = t.id AND c.period_id = ?
                   AND c.status IN ('submitted', 'approved'))
         FROM tracks t WHERE t.active = 1 ORDER BY t.name",
    )?;
    let per_track_raw = stmt
        .query_map([&period.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut per_track = Vec::with_capacity(per_track_raw.len());
    for (track_id, name, cadence_raw, enrolled, certified) in per_track_raw {
        let Some(cadence) = Cadence::from_db(&cadence_raw) else {
            continue;
        };
        // Dates due so far this period, per enrolled participant.
        let due = schedule::required_dates(
            cadence,
            period.start_date,
            today.min(period.end_date),
        )
        .len() as i64;
        let expected = due * enrolled;
        let completion_rate = if expected == 0 {
            0.0
        } else {
            schedule::round_off_1_decimal(100.0 * certified as f64 / expected as f64)
        };
        per_track.push(json!({
            "trackId": track_id,
            "trackName": name,
            "cadence": cadence.as_db(),
            "enrolledCount": enrolled,
            "certifiedCount": certified,
            "dueCount": due,
            "completionRate": completion_rate,
        }));
    }

    Ok(json!({
        "period": {
            "id": period.id,
            "termNumber": period.term_number,
            "startDate": period.start_date.format("%Y-%m-%d").to_string(),
            "endDate": period.end_date.format("%Y-%m-%d").to_string(),
        },
        "participantCount": participant_count,
        "submissionCount": submission_count,
        "tracks": per_track,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "admin.trackingOverview" => overview(state, &req.params),
        "admin.stats" => stats(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, &req.method, out))
}
