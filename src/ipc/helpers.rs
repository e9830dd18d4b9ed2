use crate::ipc::types::Request;

/// Trimmed, non-empty string parameter.
pub fn str_param(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn i64_param(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

pub fn f64_param(req: &Request, key: &str) -> Option<f64> {
    req.params.get(key).and_then(|v| v.as_f64())
}

pub fn bool_param(req: &Request, key: &str) -> bool {
    req.params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}
