use crate::db;
use crate::grading::GradeScale;
use crate::ipc::error::STORAGE_ERROR;
use crate::ipc::helpers::{to_json, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::results::{self, load_grade_scale, GRADE_SCALE_KEY};
use rusqlite::Connection;
use serde_json::json;

fn storage(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new(STORAGE_ERROR, format!("{e:#}"))
}

fn grade_scale_get(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let custom = db::settings_get_json(conn, GRADE_SCALE_KEY)
        .map_err(storage)?
        .is_some();
    let scale = load_grade_scale(conn);
    Ok(json!({ "bands": scale.bands(), "custom": custom }))
}

fn grade_scale_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(raw) = params.get("bands") else {
        return Err(HandlerErr::bad_params("missing bands[]"));
    };
    let scale = GradeScale::from_json(raw)?;
    let regraded = results::apply_grade_scale(conn, Some(&scale))?;
    Ok(json!({ "bands": scale.bands(), "custom": true, "regraded": to_json(&regraded)? }))
}

fn grade_scale_reset(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let regraded = results::apply_grade_scale(conn, None)?;
    Ok(json!({
        "bands": GradeScale::canonical().bands(),
        "custom": false,
        "regraded": to_json(&regraded)?
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.gradeScale.get" => Some(with_db(state, req, grade_scale_get)),
        "settings.gradeScale.set" => Some(with_db(state, req, grade_scale_set)),
        "settings.gradeScale.reset" => Some(with_db(state, req, grade_scale_reset)),
        _ => None,
    }
}
