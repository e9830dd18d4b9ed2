use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::calc::CalculatorRegistry;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub store_path: Option<PathBuf>,
    pub db: Option<Connection>,
    pub registry: CalculatorRegistry,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            store_path: None,
            db: None,
            registry: CalculatorRegistry::default(),
        }
    }
}
