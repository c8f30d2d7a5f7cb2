use crate::grading::GradingError;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

fn code_taken(conn: &Connection, code: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let other: Option<String> = conn
        .query_row("SELECT id FROM subjects WHERE code = ?", [code], |r| r.get(0))
        .optional()?;
    Ok(match (other, except_id) {
        (Some(id), Some(except)) => id != except,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn reference_count(conn: &Connection, subject_id: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM subject_results WHERE subject_id = ?",
        [subject_id],
        |r| r.get(0),
    )?)
}

fn subjects_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.code, s.description,
                (SELECT COUNT(*) FROM subject_results sr WHERE sr.subject_id = s.id)
         FROM subjects s
         ORDER BY s.code",
    )?;
    let subjects = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: String = row.get(2)?;
            let description: Option<String> = row.get(3)?;
            let used_by: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "description": description,
                "subjectResultCount": used_by
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    let code = normalize_code(&get_required_str(params, "code")?);
    let description = get_optional_str(params, "description")?;
    if name.is_empty() || code.is_empty() {
        return Err(HandlerErr::bad_params("name and code must not be empty"));
    }
    if code_taken(conn, &code, None)? {
        return Err(GradingError::validation("subject code already exists")
            .with_details(json!({ "code": code }))
            .into());
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, description) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, &code, &description),
    )?;
    log::info!(
        "subjects.create {}",
        json!({ "subjectId": subject_id, "code": code }),
    );
    Ok(json!({ "subjectId": subject_id, "code": code }))
}

fn subjects_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let current: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT name, code, description FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((mut name, mut code, mut description)) = current else {
        return Err(GradingError::not_found("subject not found")
            .with_details(json!({ "subjectId": subject_id }))
            .into());
    };

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::bad_params("patch.name must be a non-empty string"));
        };
        name = s.to_string();
    }
    if let Some(v) = patch.get("code") {
        let Some(s) = v.as_str().map(normalize_code).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::bad_params("patch.code must be a non-empty string"));
        };
        if code_taken(conn, &s, Some(&subject_id))? {
            return Err(GradingError::validation("subject code already exists")
                .with_details(json!({ "code": s }))
                .into());
        }
        code = s;
    }
    if let Some(v) = patch.get("description") {
        description = if v.is_null() {
            None
        } else {
            Some(
                v.as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.description must be a string or null"))?
                    .to_string(),
            )
        };
    }

    conn.execute(
        "UPDATE subjects SET name = ?, code = ?, description = ? WHERE id = ?",
        (&name, &code, &description, &subject_id),
    )?;
    Ok(json!({ "subjectId": subject_id, "name": name, "code": code, "description": description }))
}

fn subjects_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(GradingError::not_found("subject not found")
            .with_details(json!({ "subjectId": subject_id }))
            .into());
    }

    let references = reference_count(conn, &subject_id)?;
    if references > 0 {
        return Err(
            GradingError::invalid_state("subject is referenced by recorded results")
                .with_details(json!({ "subjectId": subject_id, "references": references }))
                .into(),
        );
    }

    conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])?;
    log::info!("subjects.delete {}", json!({ "subjectId": subject_id }));
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_db(state, req, subjects_list)),
        "subjects.create" => Some(with_db(state, req, subjects_create)),
        "subjects.update" => Some(with_db(state, req, subjects_update)),
        "subjects.delete" => Some(with_db(state, req, subjects_delete)),
        _ => None,
    }
}
