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

#[test]
fn zero_score_reads_back_as_zero_not_null() {
    let db_path = temp_db_path("gradebook-zero");
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
        json!({
            "number": "12A",
            "name": "Introduction to Logic",
            "semester": "Spring",
            "year": 2012,
            "weightScheme": "possible_points"
        }),
    );
    let course_id = course
        .pointer("/course/id")
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "firstName": "Austin", "lastName": "Powers", "sid": "12345678" }),
    );
    let student_id = student
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.add",
        json!({ "courseId": course_id, "studentId": student_id }),
    );
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.create",
        json!({ "courseId": course_id, "name": "HW1", "weight": 105.0 }),
    );
    let assignment_id = assignment
        .pointer("/assignment/id")
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.enter",
        json!({
            "assignmentId": assignment_id,
            "studentId": student_id,
            "gradeType": "points",
            "value": 0
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.list",
        json!({ "studentId": student_id }),
    );
    let rows = listed
        .get("grades")
        .and_then(|v| v.as_array())
        .expect("grades array");
    assert_eq!(rows.len(), 1);
    let value = rows[0].get("value").expect("value present");
    assert!(!value.is_null(), "zero must not decay to null: {}", rows[0]);
    assert_eq!(value.as_f64(), Some(0.0));
}
