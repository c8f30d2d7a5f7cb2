use crate::grading::{GradingError, SubjectMarks};
use crate::ipc::helpers::{
    get_bool, get_optional_str, get_required_str, get_scope, get_term, to_json, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::results::{self, Submission};
use rusqlite::Connection;
use serde_json::json;

const SUBMIT_MAX_SUBJECTS: usize = 64;

fn mark_field(
    obj: &serde_json::Map<String, serde_json::Value>,
    index: usize,
    field: &str,
) -> Result<f64, HandlerErr> {
    obj.get(field).and_then(|v| v.as_f64()).ok_or_else(|| {
        GradingError::validation(format!("subjectMarks[{}].{} must be a number", index, field))
            .with_details(json!({ "index": index, "field": field }))
            .into()
    })
}

fn parse_subject_marks(params: &serde_json::Value) -> Result<Vec<SubjectMarks>, HandlerErr> {
    let Some(arr) = params.get("subjectMarks").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing subjectMarks[]"));
    };
    if arr.len() > SUBMIT_MAX_SUBJECTS {
        return Err(HandlerErr::bad_params("too many subjects in one submission").with_details(
            json!({ "count": arr.len(), "max": SUBMIT_MAX_SUBJECTS }),
        ));
    }

    let mut marks = Vec::with_capacity(arr.len());
    for (i, entry) in arr.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return Err(HandlerErr::bad_params(format!(
                "subjectMarks[{}] must be an object",
                i
            )));
        };
        let Some(subject_id) = obj.get("subjectId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params(format!(
                "subjectMarks[{}] missing subjectId",
                i
            )));
        };
        marks.push(SubjectMarks {
            subject_id: subject_id.to_string(),
            ca1: mark_field(obj, i, "ca1")?,
            ca2: mark_field(obj, i, "ca2")?,
            exam: mark_field(obj, i, "exam")?,
        });
    }
    Ok(marks)
}

fn results_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let scope = get_scope(params)?;
    let entered_by = get_required_str(params, "enteredBy")?;
    let remarks = get_optional_str(params, "remarks")?;
    let subject_marks = parse_subject_marks(params)?;

    let submission = Submission {
        student_id,
        scope,
        subject_marks,
        entered_by,
        remarks,
    };
    let scale = results::load_grade_scale(conn);
    let stored = results::submit_results(conn, &submission, &scale)?;
    Ok(json!({ "result": to_json(&stored)? }))
}

fn results_rank_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let scope = get_scope(params)?;
    let summary = results::rank_class(conn, &scope)?;
    to_json(&summary)
}

fn results_publish(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let stored = results::publish_result(conn, &result_id)?;
    Ok(json!({ "result": to_json(&stored)? }))
}

fn results_publish_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let scope = get_scope(params)?;
    let summary = results::publish_class_results(conn, &scope)?;
    to_json(&summary)
}

fn results_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let term = get_term(params)?;
    let class_id = get_optional_str(params, "classId")?;
    let privileged = get_bool(params, "privileged", false);

    let stored = results::get_student_result(
        conn,
        &student_id,
        &academic_year,
        term,
        class_id.as_deref(),
        privileged,
    )?;
    Ok(json!({ "result": to_json(&stored)? }))
}

fn results_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let scope = get_scope(params)?;
    let privileged = get_bool(params, "privileged", false);
    let rows = results::list_class_results(conn, &scope, privileged)?;
    Ok(json!({ "results": to_json(&rows)? }))
}

fn results_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    results::delete_result(conn, &result_id)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.submit" => Some(with_db(state, req, results_submit)),
        "results.rankClass" => Some(with_db(state, req, results_rank_class)),
        "results.publish" => Some(with_db(state, req, results_publish)),
        "results.publishClass" => Some(with_db(state, req, results_publish_class)),
        "results.get" => Some(with_db(state, req, results_get)),
        "results.list" => Some(with_db(state, req, results_list)),
        "results.delete" => Some(with_db(state, req, results_delete)),
        _ => None,
    }
}
