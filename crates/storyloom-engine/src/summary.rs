use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::orchestrator::RunReport;

/// Writes `report` as pretty JSON, tagged with the run id and a write stamp.
pub fn write_summary(path: &Path, run_id: &str, report: &RunReport) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert("run_id".to_string(), Value::String(run_id.to_string()));
    if let Value::Object(fields) = serde_json::to_value(report)? {
        payload.extend(fields);
    }
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
