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

fn student_count(result: &serde_json::Value) -> usize {
    result
        .get("students")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}

#[test]
fn multi_enrollment_student_listed_once() {
    let db_path = temp_db_path("gradebook-scoped-students");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "gradedb.open",
        json!({ "path": db_path.to_string_lossy() }),
    );

    let mut course_ids = Vec::new();
    for (i, number) in [("2", "12A"), ("3", "25A")] {
        let course = request_ok(
            &mut stdin,
            &mut reader,
            i,
            "courses.create",
            json!({ "number": number, "name": format!("Course {}", number), "semester": "Fall", "year": 2013 }),
        );
        course_ids.push(
            course
                .pointer("/course/id")
                .and_then(|v| v.as_str())
                .expect("course id")
                .to_string(),
        );
    }

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "firstName": "Ada", "lastName": "Lovelace", "sid": "98765432" }),
    );
    let student_id = student
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();

    for (i, course_id) in [("5", &course_ids[0]), ("6", &course_ids[1])] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            i,
            "enrollments.add",
            json!({ "courseId": course_id, "studentId": student_id }),
        );
    }

    // Unscoped listing: the double enrollment must not duplicate the row.
    let all = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({}));
    assert_eq!(student_count(&all), 1);

    // Scoped to one course: still exactly one row.
    let scoped = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.list",
        json!({ "courseId": course_ids[0] }),
    );
    assert_eq!(student_count(&scoped), 1);

    // Fuzzy name matching only applies when asked for.
    let fuzzy = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.list",
        json!({ "lastName": "ovela", "fuzzy": true }),
    );
    assert_eq!(student_count(&fuzzy), 1);
    let exact = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "lastName": "ovela" }),
    );
    assert_eq!(student_count(&exact), 0);
}
