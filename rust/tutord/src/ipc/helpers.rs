use crate::attendance::AttendanceError;
use crate::fees::{self, parse_date_lenient};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn db_query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn db_insert(table: &str, e: impl std::fmt::Display) -> Self {
        Self::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn db_update(table: &str, e: impl std::fmt::Display) -> Self {
        Self::new("db_update_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn db_delete(table: &str, e: impl std::fmt::Display) -> Self {
        Self::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<AttendanceError> for HandlerErr {
    fn from(e: AttendanceError) -> Self {
        let code = match e {
            AttendanceError::NotPunchedIn { .. } => "not_found",
            AttendanceError::OutBeforeIn { .. } | AttendanceError::NotADayMark(_) => "bad_params",
            AttendanceError::AlreadyPunchedIn { .. }
            | AttendanceError::AlreadyClosed { .. }
            | AttendanceError::DayMarked(_) => "conflict",
        };
        Self::new(code, e.to_string())
    }
}

/// Runs `f` against the open workspace database and wraps the outcome in the
/// response envelope.
pub fn with_db<F>(state: &AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string; empty strings read as absent.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Grades arrive either as strings ("5", "UKG") or bare numbers.
pub fn get_grade(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let grade = match params.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(HandlerErr::bad_params(format!("missing {}", key))),
    };
    if !fees::is_supported_grade(&grade) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be a named grade or 1..={}",
            key,
            fees::MAX_NUMERIC_GRADE
        ))
        .with_details(json!({ "grade": grade })));
    }
    Ok(grade)
}

pub fn get_optional_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_optional_str(params, key) {
        Some(raw) => parse_date_lenient(&raw)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
        None => Ok(None),
    }
}

pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    get_optional_date(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_datetime(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<NaiveDateTime>, HandlerErr> {
    let Some(raw) = get_optional_str(params, key) else {
        return Ok(None);
    };
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&raw, f).ok())
        .map(Some)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DDTHH:MM[:SS]", key)))
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))
}

pub fn parse_json_column<T: serde::de::DeserializeOwned>(
    text: &str,
    column: &str,
) -> Result<T, HandlerErr> {
    serde_json::from_str(text).map_err(|e| {
        HandlerErr::new("db_query_failed", format!("corrupt {}: {}", column, e))
    })
}

pub fn to_json_column<T: serde::Serialize>(value: &T) -> Result<String, HandlerErr> {
    serde_json::to_string(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}
