use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::str_param;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store_path) = state.store_path.clone() else {
        return err(&req.id, "no_store", "open a grade database first", None);
    };
    let Some(out_path) = str_param(req, "outPath").map(PathBuf::from) else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };

    match backup::export_bundle(&store_path, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy(),
            }),
        ),
        Err(e) => err(&req.id, "backup_failed", format!("{e:?}"), None),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = str_param(req, "inPath").map(PathBuf::from) else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let target = match str_param(req, "path").map(PathBuf::from) {
        Some(p) => p,
        None => match state.store_path.clone() {
            Some(p) => p,
            None => return err(&req.id, "bad_params", "missing path and no open store", None),
        },
    };

    // Release the current connection before the file underneath it is
    // swapped out.
    if state.store_path.as_deref() == Some(target.as_path()) {
        state.db = None;
    }

    let summary = match backup::import_bundle(&in_path, &target) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "restore_failed", format!("{e:?}"), None),
    };

    match db::open_db(&target) {
        Ok(conn) => {
            state.store_path = Some(target.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "bundleFormatDetected": summary.bundle_format_detected,
                    "dbSha256": summary.db_sha256,
                    "storePath": target.to_string_lossy(),
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
