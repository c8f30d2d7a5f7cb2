use crate::grading::GradingError;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::results::class_exists;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn require_class(conn: &Connection, class_id: &str) -> Result<(), HandlerErr> {
    if !class_exists(conn, class_id)? {
        return Err(GradingError::not_found("class not found")
            .with_details(json!({ "classId": class_id }))
            .into());
    }
    Ok(())
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;

    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, student_no
         FROM students
         WHERE class_id = ?
         ORDER BY last_name, first_name, id",
    )?;
    let students = stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let student_no: Option<String> = row.get(3)?;
            Ok(json!({
                "id": id,
                "lastName": last,
                "firstName": first,
                "displayName": format!("{}, {}", last, first),
                "studentNo": student_no
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    let student_no = get_optional_str(params, "studentNo")?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr::bad_params("lastName and firstName must not be empty"));
    }
    require_class(conn, &class_id)?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no)
         VALUES(?, ?, ?, ?, ?)",
        (&student_id, &class_id, &last_name, &first_name, &student_no),
    )?;
    Ok(json!({ "studentId": student_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_db(state, req, students_list)),
        "students.create" => Some(with_db(state, req, students_create)),
        _ => None,
    }
}
