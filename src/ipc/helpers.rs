use crate::grading::{GradingError, Term};
use crate::ipc::error::{err, ok, BAD_PARAMS, NO_WORKSPACE, SERIALIZE_FAILED, STORAGE_ERROR};
use crate::ipc::types::{AppState, Request};
use crate::results::Scope;
use rusqlite::Connection;
use serde::Serialize;
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
        Self::new(BAD_PARAMS, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<GradingError> for HandlerErr {
    fn from(e: GradingError) -> Self {
        Self {
            code: e.code(),
            message: e.message,
            details: e.details,
        }
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        GradingError::from(e).into()
    }
}

/// Runs a handler body against the open workspace and logs failures by severity.
pub fn with_db<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, NO_WORKSPACE, "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => {
            let fields = json!({
                "method": req.method,
                "requestId": req.id,
                "code": e.code,
                "message": e.message,
            });
            if e.code == STORAGE_ERROR {
                log::error!("ipc.request_failed {}", fields);
            } else {
                log::debug!("ipc.request_rejected {}", fields);
            }
            e.response(&req.id)
        }
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new(SERIALIZE_FAILED, e.to_string()))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string or null", key))),
    }
}

pub fn get_bool(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

pub fn get_term(params: &serde_json::Value) -> Result<Term, HandlerErr> {
    let raw = get_required_str(params, "term")?;
    Ok(Term::parse(&raw)?)
}

pub fn get_scope(params: &serde_json::Value) -> Result<Scope, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let term = get_term(params)?;
    Ok(Scope::new(&class_id, &academic_year, term)?)
}
