use chrono::{NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::db;
use crate::ipc::error::ApiError;
use crate::schedule::{self, Cadence, CertRow};

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, ApiError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_required_u32(params: &serde_json::Value, key: &str) -> Result<u32, ApiError> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ApiError::bad_params(format!("missing {}", key)))
}

pub fn get_required_i32(params: &serde_json::Value, key: &str) -> Result<i32, ApiError> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| ApiError::bad_params(format!("missing {}", key)))
}

pub fn parse_uuid(value: &str, key: &str) -> Result<String, ApiError> {
    Uuid::parse_str(value)
        .map(|u| u.to_string())
        .map_err(|_| ApiError::bad_params(format!("{} must be a UUID", key)))
}

pub fn get_uuid(params: &serde_json::Value, key: &str) -> Result<String, ApiError> {
    parse_uuid(&get_required_str(params, key)?, key)
}

pub fn parse_iso_date(value: &str, key: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn get_iso_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, ApiError> {
    parse_iso_date(&get_required_str(params, key)?, key)
}

pub fn validate_url(value: &str) -> Result<(), ApiError> {
    let t = value.trim();
    let scheme_ok = t.starts_with("http://") || t.starts_with("https://");
    if !scheme_ok || t.len() > 2048 || t.chars().any(char::is_whitespace) {
        return Err(ApiError::bad_params("url must be a http(s) URL"));
    }
    Ok(())
}

/// Server-assigned audit timestamp (UTC, RFC 3339). Not a date-window input;
/// those go through the injected clock.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Admin gate for privileged methods: missing identity is 401-equivalent,
/// a known non-admin identity is 403-equivalent.
pub fn require_admin(conn: &Connection, params: &serde_json::Value) -> Result<String, ApiError> {
    let user_id = params
        .get("userId")
        .and_then(|v| v.as_str())
        .ok_or(ApiError::Unauthenticated)?;
    let user_id = parse_uuid(user_id, "userId")?;
    if !db::is_admin(conn, &user_id)? {
        return Err(ApiError::Forbidden);
    }
    Ok(user_id)
}

pub fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, ApiError> {
    Ok(conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

#[derive(Debug, Clone)]
pub struct PeriodRow {
    pub id: String,
    pub term_number: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl PeriodRow {
    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        (self.start_date, self.end_date)
    }
}

pub fn active_period(conn: &Connection) -> Result<Option<PeriodRow>, ApiError> {
    let row = conn
        .query_row(
            "SELECT id, term_number, start_date, end_date
             FROM periods WHERE active = 1
             ORDER BY term_number DESC LIMIT 1",
            [],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((id, term_number, start_raw, end_raw)) = row else {
        return Ok(None);
    };
    let start_date = schedule::normalize_date_str(&start_raw)
        .ok_or_else(|| ApiError::bad_params("stored period start_date is unparseable"))?;
    let end_date = schedule::normalize_date_str(&end_raw)
        .ok_or_else(|| ApiError::bad_params("stored period end_date is unparseable"))?;
    Ok(Some(PeriodRow {
        id,
        term_number,
        start_date,
        end_date,
    }))
}

#[derive(Debug, Clone)]
pub struct TrackRow {
    pub id: String,
    pub name: String,
    pub cadence: Cadence,
    pub active: bool,
}

pub fn load_track(conn: &Connection, track_id: &str) -> Result<TrackRow, ApiError> {
    let row = conn
        .query_row(
            "SELECT id, name, cadence, active FROM tracks WHERE id = ?",
            [track_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((id, name, cadence_raw, active)) = row else {
        return Err(ApiError::NotFound("track"));
    };
    let cadence = Cadence::from_db(&cadence_raw)
        .ok_or_else(|| ApiError::bad_params(format!("unknown cadence: {}", cadence_raw)))?;
    Ok(TrackRow {
        id,
        name,
        cadence,
        active: active != 0,
    })
}

/// Certification rows for one (user, track) inside [lo, hi], dates normalized
/// for the status derivator. Rows with unparseable dates are skipped rather
/// than failing the whole view.
pub fn cert_rows_for(
    conn: &Connection,
    user_id: &str,
    track_id: &str,
    lo: NaiveDate,
    hi: NaiveDate,
) -> Result<Vec<CertRow>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT certification_date, status
         FROM certifications
         WHERE user_id = ? AND track_id = ?
           AND certification_date >= ? AND certification_date <= ?",
    )?;
    let raw = stmt
        .query_map(
            (
                user_id,
                track_id,
                lo.format("%Y-%m-%d").to_string(),
                // Timestamp-bearing dates sort after the bare date; widen the
                // upper bound one day so string comparison cannot drop them.
                (hi + chrono::Duration::days(1))
                    .format("%Y-%m-%d")
                    .to_string(),
            ),
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let mut rows = Vec::with_capacity(raw.len());
    for (date_raw, status) in raw {
        match schedule::normalize_date_str(&date_raw) {
            Some(date) if date >= lo && date <= hi => rows.push(CertRow { date, status }),
            Some(_) => {}
            None => {
                tracing::debug!(date = %date_raw, "skipping certification with unparseable date");
            }
        }
    }
    Ok(rows)
}
