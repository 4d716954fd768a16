use serde_json::json;
use thiserror::Error;

/// Handler error taxonomy. `code()` values are wire contract; clients key
/// retry/redirect behavior on them, so variants map one-to-one onto the
/// platform's status-code conventions (400/401/403/404/500).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadParams(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("authentication required")]
    Unauthenticated,
    #[error("admin privileges required")]
    Forbidden,
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{message}")]
    Backend { op: &'static str, message: String },
}

impl ApiError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        ApiError::BadParams(message.into())
    }

    pub fn update(e: rusqlite::Error) -> Self {
        ApiError::Backend {
            op: "db_update_failed",
            message: e.to_string(),
        }
    }

    pub fn tx(e: rusqlite::Error) -> Self {
        ApiError::Backend {
            op: "db_tx_failed",
            message: e.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadParams(_) => "bad_params",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Forbidden => "forbidden",
            ApiError::NoWorkspace => "no_workspace",
            ApiError::Backend { op, .. } => op,
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Backend {
            op: "db_query_failed",
            message: e.to_string(),
        }
    }
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Wrap a handler result into the wire envelope, logging failures.
pub fn respond(
    id: &str,
    method: &str,
    result: Result<serde_json::Value, ApiError>,
) -> serde_json::Value {
    match result {
        Ok(value) => ok(id, value),
        Err(e) => {
            tracing::warn!(method, code = e.code(), "request failed: {}", e);
            err(id, e.code(), e.to_string(), None)
        }
    }
}
