use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

#[test]
fn subject_codes_are_unique_and_normalized() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "resultsd-subjects-codes");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "subjects.create",
        json!({ "name": "Agricultural Science", "code": " agr ", "description": "Crop and animal husbandry" }),
    );
    assert_eq!(created["code"], "AGR");
    let agr = created["subjectId"].as_str().expect("subjectId").to_string();

    let clash = request(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Agriculture", "code": "AGR" }),
    );
    assert_eq!(error_code(&clash), Some("validation_error"));

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Home Economics", "code": "HEC" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();

    let rename_clash = request(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.update",
        json!({ "subjectId": other, "patch": { "code": "agr" } }),
    );
    assert_eq!(error_code(&rename_clash), Some("validation_error"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.update",
        json!({ "subjectId": agr, "patch": { "name": "Agric. Science", "description": null } }),
    );
    assert_eq!(updated["name"], "Agric. Science");
    assert_eq!(updated["code"], "AGR");
    assert!(updated["description"].is_null());

    let missing = request(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.update",
        json!({ "subjectId": "nope", "patch": { "name": "X" } }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    let listed = request_ok(&mut stdin, &mut reader, "7", "subjects.list", json!({}));
    let codes: Vec<&str> = listed["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .filter_map(|s| s["code"].as_str())
        .collect();
    assert_eq!(codes, vec!["AGR", "HEC"]);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.delete",
        json!({ "subjectId": other }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "9", "subjects.list", json!({}));
    assert_eq!(listed["subjects"].as_array().map(|v| v.len()), Some(1));

    let _ = child.kill();
}

#[test]
fn referenced_subject_cannot_be_deleted() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "resultsd-subjects-guard");

    let class_id = request_ok(&mut stdin, &mut reader, "1", "classes.create", json!({ "name": "JSS 3" }))
        ["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "classId": class_id, "lastName": "Eze", "firstName": "Chidi", "studentNo": "JS3/014" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "French", "code": "FRE" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.submit",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "academicYear": "2024/2025",
            "term": "first",
            "enteredBy": "t.eze",
            "subjectMarks": [{ "subjectId": subject_id, "ca1": 10, "ca2": 10, "exam": 30 }]
        }),
    );

    let blocked = request(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(error_code(&blocked), Some("invalid_state"));

    let listed = request_ok(&mut stdin, &mut reader, "6", "subjects.list", json!({}));
    assert_eq!(listed["subjects"][0]["subjectResultCount"], 1);

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(students["students"][0]["displayName"], "Eze, Chidi");
    assert_eq!(students["students"][0]["studentNo"], "JS3/014");

    let _ = child.kill();
}
