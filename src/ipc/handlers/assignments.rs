use crate::ipc::error::{err, ok, store_err};
use crate::ipc::helpers::{bool_param, f64_param, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, AssignmentFilter, AssignmentOrigin, AssignmentUpdate};
use serde_json::json;

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };

    let origin = match str_param(req, "origin") {
        None => None,
        Some(raw) => match AssignmentOrigin::parse(&raw) {
            Some(o) => Some(o),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "origin must be entered or calculated",
                    Some(json!({ "origin": raw })),
                )
            }
        },
    };

    let filter = AssignmentFilter {
        assignment_id: str_param(req, "assignmentId"),
        course_id: str_param(req, "courseId"),
        name: str_param(req, "name"),
        origin,
        fuzzy: bool_param(req, "fuzzy"),
    };

    match store::select_assignments(conn, &filter) {
        Ok(rows) => ok(&req.id, json!({ "assignments": to_json(&rows) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(course_id) = str_param(req, "courseId") else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let Some(name) = str_param(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let description = str_param(req, "description");
    let due_date = str_param(req, "dueDate");
    let weight = f64_param(req, "weight");

    // Calculated-origin assignments only ever come from the engine.
    match store::insert_assignment(
        conn,
        &course_id,
        &name,
        description.as_deref(),
        due_date.as_deref(),
        weight,
        AssignmentOrigin::Entered,
    ) {
        Ok(row) => ok(&req.id, json!({ "assignment": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_assignments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(assignment_id) = str_param(req, "assignmentId") else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };

    let update = AssignmentUpdate {
        name: str_param(req, "name"),
        description: str_param(req, "description"),
        due_date: str_param(req, "dueDate"),
        weight: f64_param(req, "weight"),
    };

    match store::update_assignment(conn, &assignment_id, &update) {
        Ok(row) => ok(&req.id, json!({ "assignment": to_json(&row) })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(assignment_id) = str_param(req, "assignmentId") else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };

    match store::delete_assignment(conn, &assignment_id) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => store_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.update" => Some(handle_assignments_update(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
