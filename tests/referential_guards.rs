use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_db_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{}-{}.sqlite3",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ))
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

#[test]
fn typed_failures_surface_as_stable_codes() {
    let db_path = temp_db_path("gradebook-guards");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "gradedb.open",
        json!({ "path": db_path.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "number": "12A", "name": "Introduction to Logic", "semester": "Fall", "year": 2013 }),
    );
    let course_id = course
        .pointer("/course/id")
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();
    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "firstName": "Ada", "lastName": "Lovelace", "sid": "98765432" }),
    );
    let enrolled_id = enrolled
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();
    let outsider = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "firstName": "Grace", "lastName": "Hopper", "sid": "12345678" }),
    );
    let outsider_id = outsider
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.add",
        json!({ "courseId": course_id, "studentId": enrolled_id }),
    );
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.create",
        json!({ "courseId": course_id, "name": "Paper 1", "weight": 100.0 }),
    );
    let assignment_id = assignment
        .pointer("/assignment/id")
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();

    // A grade for a student who is not enrolled is an integrity failure,
    // not a write.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "grades.enter",
        json!({
            "assignmentId": assignment_id,
            "studentId": outsider_id,
            "gradeType": "letter",
            "value": "A"
        }),
    );
    assert_eq!(code, "referential_integrity");

    // Calculation without a registered calculator is surfaced, not
    // silently skipped.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "8",
        "calc.run",
        json!({ "courseId": course_id }),
    );
    assert_eq!(code, "calculator_not_found");

    // Withdrawing a student who still has recorded grades is refused.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.enter",
        json!({
            "assignmentId": assignment_id,
            "studentId": enrolled_id,
            "gradeType": "letter",
            "value": "B"
        }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "10",
        "enrollments.remove",
        json!({ "courseId": course_id, "studentId": enrolled_id }),
    );
    assert_eq!(code, "referential_integrity");

    // Calculated grades cannot be edited by hand.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "calculators.register",
        json!({
            "number": "12A",
            "semester": "Fall",
            "year": 2013,
            "calculator": "letter_average",
            "missingPolicy": "skip"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "calc.run",
        json!({ "courseId": course_id }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.list",
        json!({ "courseId": course_id, "provenance": "calculated" }),
    );
    let calculated_id = listed
        .get("grades")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|g| g.get("id"))
        .and_then(|v| v.as_str())
        .expect("calculated grade id")
        .to_string();
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "14",
        "grades.update",
        json!({ "gradeId": calculated_id, "gradeType": "letter", "value": "A+" }),
    );
    assert_eq!(code, "referential_integrity");
}
