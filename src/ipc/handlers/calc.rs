use crate::calc::{self, CourseKey, MissingPolicy, ResolutionPolicy};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{i64_param, str_param, to_json};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Missing policy comes in as `"skip"`, `"incomplete"`, or
/// `{"substitute": "F"}`. There is no default: the policy is part of the
/// calculator's declared contract.
fn parse_missing_policy(raw: Option<&serde_json::Value>) -> Result<MissingPolicy, String> {
    let Some(raw) = raw else {
        return Err("missing missingPolicy".to_string());
    };
    if let Some(s) = raw.as_str() {
        return match s {
            "skip" => Ok(MissingPolicy::Skip),
            "incomplete" => Ok(MissingPolicy::Incomplete),
            other => Err(format!(
                "missingPolicy {:?} is not skip, incomplete, or {{\"substitute\": <letter>}}",
                other
            )),
        };
    }
    if let Some(obj) = raw.as_object() {
        if let Some(letter) = obj.get("substitute").and_then(|v| v.as_str()) {
            let letter = letter.trim();
            if letter.is_empty() {
                return Err("substitute letter must not be empty".to_string());
            }
            return Ok(MissingPolicy::Substitute(letter.to_string()));
        }
    }
    Err("missingPolicy must be a string or {\"substitute\": <letter>}".to_string())
}

fn handle_calculators_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(number) = str_param(req, "number") else {
        return err(&req.id, "bad_params", "missing number", None);
    };
    let Some(semester) = str_param(req, "semester") else {
        return err(&req.id, "bad_params", "missing semester", None);
    };
    let Some(year) = i64_param(req, "year") else {
        return err(&req.id, "bad_params", "missing year", None);
    };
    let Some(kind) = str_param(req, "calculator") else {
        return err(&req.id, "bad_params", "missing calculator", None);
    };
    let missing = match parse_missing_policy(req.params.get("missingPolicy")) {
        Ok(p) => p,
        Err(message) => return err(&req.id, "bad_params", message, None),
    };

    let Some(calculator) = calc::builtin_calculator(&kind, missing) else {
        return err(
            &req.id,
            "bad_params",
            "calculator must be letter_average or points_total",
            Some(json!({ "calculator": kind })),
        );
    };

    let key = CourseKey::new(&number, &semester, year);
    let registered = key.to_string();
    state.registry.register(key, calculator);
    ok(&req.id, json!({ "registered": registered, "calculator": kind }))
}

fn handle_calculators_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = state
        .registry
        .registered()
        .into_iter()
        .map(|(course, calculator)| json!({ "course": course, "calculator": calculator }))
        .collect();
    ok(&req.id, json!({ "calculators": rows }))
}

fn handle_calc_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(course_id) = str_param(req, "courseId") else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let only_student = str_param(req, "studentId");

    let policy = match str_param(req, "resolution") {
        None => ResolutionPolicy::MostRecent,
        Some(raw) => match ResolutionPolicy::parse(&raw) {
            Some(p) => p,
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

    match calc::run_course_calculation(
        conn,
        &state.registry,
        &course_id,
        only_student.as_deref(),
        policy,
    ) {
        Ok(report) => ok(&req.id, json!({ "report": to_json(&report) })),
        Err(e) => calc_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calculators.register" => Some(handle_calculators_register(state, req)),
        "calculators.list" => Some(handle_calculators_list(state, req)),
        "calc.run" => Some(handle_calc_run(state, req)),
        _ => None,
    }
}
