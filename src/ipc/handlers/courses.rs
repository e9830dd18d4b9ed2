use crate::ipc::error::{err, ok, store_err};
use crate::ipc::helpers::{bool_param, i64_param, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, CourseFilter, CourseUpdate, EnrollmentFilter, WeightScheme};
use serde_json::json;

fn parse_weight_scheme(req: &Request) -> Result<Option<WeightScheme>, serde_json::Value> {
    let Some(raw) = str_param(req, "weightScheme") else {
        return Ok(None);
    };
    match WeightScheme::parse(&raw) {
        Some(scheme) => Ok(Some(scheme)),
        None => Err(err(
            &req.id,
            "bad_params",
            "weightScheme must be percent_of_grade or possible_points",
            Some(json!({ "weightScheme": raw })),
        )),
    }
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };

    let filter = CourseFilter {
        course_id: str_param(req, "courseId"),
        number: str_param(req, "number"),
        name: str_param(req, "name"),
        semester: str_param(req, "semester"),
        year: i64_param(req, "year"),
        student_id: str_param(req, "studentId"),
        fuzzy: bool_param(req, "fuzzy"),
    };

    match store::select_courses(conn, &filter) {
        Ok(rows) => ok(&req.id, json!({ "courses": to_json(&rows) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };

    let Some(number) = str_param(req, "number") else {
        return err(&req.id, "bad_params", "missing number", None);
    };
    let Some(name) = str_param(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let Some(semester) = str_param(req, "semester") else {
        return err(&req.id, "bad_params", "missing semester", None);
    };
    let Some(year) = i64_param(req, "year") else {
        return err(&req.id, "bad_params", "missing year", None);
    };
    let weight_scheme = match parse_weight_scheme(req) {
        Ok(s) => s.unwrap_or(WeightScheme::PercentOfGrade),
        Err(resp) => return resp,
    };

    match store::insert_course(conn, &number, &name, &semester, year, weight_scheme) {
        Ok(row) => ok(&req.id, json!({ "course": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(course_id) = str_param(req, "courseId") else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let weight_scheme = match parse_weight_scheme(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let update = CourseUpdate {
        number: str_param(req, "number"),
        name: str_param(req, "name"),
        semester: str_param(req, "semester"),
        year: i64_param(req, "year"),
        weight_scheme,
    };

    match store::update_course(conn, &course_id, &update) {
        Ok(row) => ok(&req.id, json!({ "course": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(course_id) = str_param(req, "courseId") else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };

    match store::delete_course(conn, &course_id) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };

    let filter = EnrollmentFilter {
        enrollment_id: str_param(req, "enrollmentId"),
        course_id: str_param(req, "courseId"),
        student_id: str_param(req, "studentId"),
    };

    match store::select_enrollments(conn, &filter) {
        Ok(rows) => ok(&req.id, json!({ "enrollments": to_json(&rows) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_enrollments_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(course_id) = str_param(req, "courseId") else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    match store::enroll_student(conn, &course_id, &student_id) {
        Ok(row) => ok(&req.id, json!({ "enrollment": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_enrollments_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(course_id) = str_param(req, "courseId") else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    match store::withdraw_student(conn, &course_id, &student_id) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => store_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.add" => Some(handle_enrollments_add(state, req)),
        "enrollments.remove" => Some(handle_enrollments_remove(state, req)),
        _ => None,
    }
}
