use serde_json::json;

use crate::calc::CalcError;
use crate::store::StoreError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

fn store_code(e: &StoreError) -> &'static str {
    match e {
        StoreError::ReferentialIntegrity(_) => "referential_integrity",
        StoreError::NoRecords(_) => "not_found",
        StoreError::Ambiguous(_) => "lookup_ambiguity",
        StoreError::BadGradeValue(_) => "bad_grade_value",
        StoreError::Db(_) => "db_query_failed",
    }
}

pub fn store_err(id: &str, e: &StoreError) -> serde_json::Value {
    err(id, store_code(e), e.to_string(), None)
}

pub fn calc_err(id: &str, e: &CalcError) -> serde_json::Value {
    match e {
        CalcError::CalculatorNotFound(_) => err(id, "calculator_not_found", e.to_string(), None),
        CalcError::WouldAlterEntered(_) => err(id, "referential_integrity", e.to_string(), None),
        CalcError::Store(se) => store_err(id, se),
    }
}
