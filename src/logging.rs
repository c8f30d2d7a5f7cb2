//! JSON-lines diagnostics on stderr through `env_logger`. stdout carries protocol only.
//!
//! Call sites log `"<event> <json object>"`; the formatter lifts the object's
//! keys into the line next to `ts`, `level` and `event`.

use env_logger::{Builder, Env, Target};
use serde_json::json;
use std::io::Write;

pub const LOG_ENV: &str = "RESULTSD_LOG";
const DEFAULT_FILTER: &str = "info";

pub fn init() {
    let env = Env::new().filter_or(LOG_ENV, DEFAULT_FILTER);
    let _ = Builder::from_env(env)
        .target(Target::Stderr)
        .format(|buf, record| {
            let ts = chrono::Utc::now().to_rfc3339();
            let line = format_line(record.level(), &record.args().to_string(), &ts);
            writeln!(buf, "{}", line)
        })
        .try_init();
}

fn format_line(level: log::Level, message: &str, ts: &str) -> String {
    let (event, rest) = match message.split_once(' ') {
        Some((event, rest)) => (event, Some(rest)),
        None => (message, None),
    };
    let mut line = json!({
        "ts": ts,
        "level": level.as_str().to_ascii_lowercase(),
        "event": event,
    });
    let fields = rest.map(|raw| {
        serde_json::from_str::<serde_json::Value>(raw).unwrap_or_else(|_| json!({ "message": raw }))
    });
    match (line.as_object_mut(), fields) {
        (Some(dst), Some(serde_json::Value::Object(src))) => {
            for (k, v) in src {
                dst.entry(k).or_insert(v);
            }
        }
        (Some(dst), Some(other)) => {
            dst.entry("message").or_insert(other);
        }
        _ => {}
    }
    line.to_string()
}
