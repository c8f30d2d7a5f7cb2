//! Response envelopes. Engine failures carry their `ErrorKind` code; the
//! codes below belong to the protocol layer itself.

use crate::grading::ErrorKind;
use serde_json::json;

pub const BAD_JSON: &str = "bad_json";
pub const BAD_PARAMS: &str = "bad_params";
pub const NO_WORKSPACE: &str = "no_workspace";
pub const NOT_IMPLEMENTED: &str = "not_implemented";
pub const DB_OPEN_FAILED: &str = "db_open_failed";
pub const SERIALIZE_FAILED: &str = "serialize_failed";
pub const STORAGE_ERROR: &str = ErrorKind::Storage.code();

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({ "id": id, "ok": true, "result": result })
}

/// `details` is omitted from the wire unless present.
pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({ "id": id, "ok": false, "error": error })
}
