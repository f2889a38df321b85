/*!
Helpers for writing hub tests: protocol line builders and polling waits.
*/

use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Initialises `env_logger` once; later calls are no-ops.
pub fn init_logging() {
    env_logger::try_init().ok();
}

/// One engine protocol line (without the trailing newline).
pub fn engine_line(cpu: f64, ram_percent: f64, disk_percent: Option<f64>) -> String {
    let mut record = json!({ "cpu": cpu, "ram_percent": ram_percent });
    if let Some(disk) = disk_percent {
        record["disk_percent"] = json!(disk);
    }
    record.to_string()
}

/// Like [`engine_line`] with extra engine fields merged in.
pub fn engine_line_with(cpu: f64, ram_percent: f64, extra: Value) -> String {
    let mut record = json!({ "cpu": cpu, "ram_percent": ram_percent });
    if let (Some(target), Value::Object(fields)) = (record.as_object_mut(), extra) {
        target.extend(fields);
    }
    record.to_string()
}

/// Polls `predicate` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
