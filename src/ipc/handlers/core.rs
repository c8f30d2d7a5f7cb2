use crate::ipc::error::{err, ok, BAD_PARAMS, DB_OPEN_FAILED};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace_path()
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, BAD_PARAMS, "missing params.path", None);
    };

    match state.select_workspace(&path) {
        Ok(()) => {
            log::info!(
                "workspace.opened {}",
                json!({ "path": path.to_string_lossy() }),
            );
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => {
            log::error!(
                "workspace.open_failed {}",
                json!({ "path": path.to_string_lossy(), "message": format!("{e:#}") }),
            );
            err(&req.id, DB_OPEN_FAILED, format!("{e:?}"), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
