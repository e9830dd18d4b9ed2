use crate::calc::{resolve_grades, ResolutionPolicy};
use crate::ipc::error::{err, ok, store_err};
use crate::ipc::helpers::{str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, GradeFilter, GradeType, GradeValue, Provenance};
use serde_json::json;

fn parse_grade_value(
    grade_type: GradeType,
    raw: &serde_json::Value,
) -> Result<GradeValue, String> {
    match grade_type {
        GradeType::Letter => raw
            .as_str()
            .map(|s| GradeValue::Letter(s.trim().to_string()))
            .filter(|v| v.as_letter().map(|l| !l.is_empty()).unwrap_or(false))
            .ok_or_else(|| "letter grade value must be a non-empty string".to_string()),
        _ => {
            let n = raw
                .as_f64()
                .ok_or_else(|| format!("{} grade value must be a number", grade_type.as_str()))?;
            GradeValue::from_number(grade_type, n).map_err(|e| e.to_string())
        }
    }
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };

    let provenance = match str_param(req, "provenance") {
        None => None,
        Some(raw) => match Provenance::parse(&raw) {
            Some(p) => Some(p),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "provenance must be entered or calculated",
                    Some(json!({ "provenance": raw })),
                )
            }
        },
    };

    let filter = GradeFilter {
        grade_id: str_param(req, "gradeId"),
        student_id: str_param(req, "studentId"),
        course_id: str_param(req, "courseId"),
        assignment_id: str_param(req, "assignmentId"),
        provenance,
    };

    let rows = match store::select_grades(conn, &filter) {
        Ok(rows) => rows,
        Err(e) => return store_err(&req.id, &e),
    };

    // With no resolution parameter the full history is returned; the
    // policy is always the caller's explicit choice.
    let rows = match str_param(req, "resolution") {
        None => rows,
        Some(raw) => match ResolutionPolicy::parse(&raw) {
            Some(policy) => resolve_grades(rows, policy),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "resolution must be mostRecent or highestValue",
                    Some(json!({ "resolution": raw })),
                )
            }
        },
    };

    ok(&req.id, json!({ "grades": to_json(&rows) }))
}

fn handle_grades_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(assignment_id) = str_param(req, "assignmentId") else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(grade_type) = str_param(req, "gradeType").and_then(|s| GradeType::parse(&s)) else {
        return err(
            &req.id,
            "bad_params",
            "gradeType must be letter, four_point, points or percentage",
            None,
        );
    };
    let Some(raw_value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    let value = match parse_grade_value(grade_type, raw_value) {
        Ok(v) => v,
        Err(message) => return err(&req.id, "bad_params", message, None),
    };

    match store::insert_grade(conn, &assignment_id, &student_id, &value, Provenance::Entered) {
        Ok(row) => ok(&req.id, json!({ "grade": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(grade_id) = str_param(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };

    let current = match store::get_grade(conn, &grade_id) {
        Ok(row) => row,
        Err(e) => return store_err(&req.id, &e),
    };
    if current.provenance == Provenance::Calculated {
        return err(
            &req.id,
            "referential_integrity",
            "calculated grades are derived; re-run the calculation instead of editing them",
            None,
        );
    }

    let grade_type = match str_param(req, "gradeType") {
        None => current.grade_type,
        Some(raw) => match GradeType::parse(&raw) {
            Some(t) => t,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "gradeType must be letter, four_point, points or percentage",
                    Some(json!({ "gradeType": raw })),
                )
            }
        },
    };
    let Some(raw_value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    let value = match parse_grade_value(grade_type, raw_value) {
        Ok(v) => v,
        Err(message) => return err(&req.id, "bad_params", message, None),
    };

    match store::update_grade_value(conn, &grade_id, &value) {
        Ok(()) => match store::get_grade(conn, &grade_id) {
            Ok(row) => ok(&req.id, json!({ "grade": to_json(&row) })),
            Err(e) => store_err(&req.id, &e),
        },
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(grade_id) = str_param(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };

    match store::delete_grade(conn, &grade_id) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => store_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.enter" => Some(handle_grades_enter(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
