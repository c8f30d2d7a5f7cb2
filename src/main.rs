mod db;
mod grading;
mod ipc;
mod logging;
mod results;

use serde_json::json;
use std::io::{self, BufRead, Write};

fn main() {
    logging::init();
    let mut state = ipc::AppState::default();
    log::info!("sidecar.start {}", json!({ "version": env!("CARGO_PKG_VERSION") }));

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                log::error!("sidecar.stdin_failed {}", json!({ "message": e.to_string() }));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No request id to echo back.
                let resp = ipc::err("", ipc::error::BAD_JSON, e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        log::debug!(
            "ipc.request {}",
            json!({ "requestId": req.id, "method": req.method }),
        );
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(stdout, "{}", resp);
        let _ = stdout.flush();
    }

    log::info!("sidecar.stop {}", json!({}));
}
