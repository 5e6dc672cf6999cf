use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring::ScoringError;
use rusqlite::Connection;

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

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<ScoringError> for HandlerErr {
    fn from(e: ScoringError) -> Self {
        // The scoring module has exactly one error kind; keep its code on the wire.
        HandlerErr {
            code: "invalid_input",
            message: e.message,
            details: e.details,
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Runs a handler that needs an open workspace database, mapping the
/// missing-workspace case and handler errors onto wire responses.
pub fn with_db(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// Calendar dates cross the wire as `YYYY-MM-DD`.
pub fn parse_date_param(value: &str, key: &str) -> Result<chrono::NaiveDate, HandlerErr> {
    chrono::NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        HandlerErr::new("bad_params", format!("{} must be a YYYY-MM-DD date", key))
    })
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_opt_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("{} must be string or null", key),
                ));
            };
            Ok(Some(s.to_string()))
        }
    }
}

pub fn get_opt_bool(
    params: &serde_json::Value,
    key: &str,
    default: bool,
) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be a boolean", key))),
    }
}
