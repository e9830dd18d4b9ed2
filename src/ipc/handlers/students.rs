use crate::ipc::error::{err, ok, store_err};
use crate::ipc::helpers::{bool_param, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, StudentFilter, StudentUpdate};
use serde_json::json;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };

    let filter = StudentFilter {
        student_id: str_param(req, "studentId"),
        sid: str_param(req, "sid"),
        course_id: str_param(req, "courseId"),
        course_name: str_param(req, "courseName"),
        last_name: str_param(req, "lastName"),
        first_name: str_param(req, "firstName"),
        email: str_param(req, "email"),
        fuzzy: bool_param(req, "fuzzy"),
    };

    match store::select_students(conn, &filter) {
        Ok(rows) => ok(&req.id, json!({ "students": to_json(&rows) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };

    let Some(first_name) = str_param(req, "firstName") else {
        return err(&req.id, "bad_params", "missing firstName", None);
    };
    let Some(last_name) = str_param(req, "lastName") else {
        return err(&req.id, "bad_params", "missing lastName", None);
    };
    let Some(sid) = str_param(req, "sid") else {
        return err(&req.id, "bad_params", "missing sid", None);
    };
    let email = str_param(req, "email");

    match store::insert_student(conn, &first_name, &last_name, &sid, email.as_deref()) {
        Ok(row) => ok(&req.id, json!({ "student": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let update = StudentUpdate {
        first_name: str_param(req, "firstName"),
        last_name: str_param(req, "lastName"),
        sid: str_param(req, "sid"),
        email: str_param(req, "email"),
    };

    match store::update_student(conn, &student_id, &update) {
        Ok(row) => ok(&req.id, json!({ "student": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    match store::delete_student(conn, &student_id) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => store_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
