use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Remix,
    Draft,
    Refine,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Remix => "remix",
            Phase::Draft => "draft",
            Phase::Refine => "refine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDone,
    DraftMissing,
}

/// Status updates for whatever presentation layer sits on top of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    RunStarted {
        project: String,
        mode: String,
    },
    PhaseStarted {
        phase: Phase,
        model: String,
        units: usize,
    },
    ModelDeployed {
        model: String,
        switched: bool,
    },
    UnitCompleted {
        phase: Phase,
        unit: String,
        images: usize,
    },
    UnitSkipped {
        phase: Phase,
        unit: String,
        reason: SkipReason,
    },
    UnitFailed {
        phase: Phase,
        unit: String,
        error: String,
    },
    RetryScheduled {
        endpoint: String,
        attempt: u64,
        reason: String,
        backoff_ms: u64,
    },
    ArtifactWritten {
        path: String,
    },
    ArtifactFailed {
        path: String,
        error: String,
    },
    RunFinished {
        written: u64,
        failed: u64,
        elapsed_s: f64,
    },
    RunAborted {
        reason: String,
    },
}

impl StatusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StatusEvent::RunStarted { .. } => "run_started",
            StatusEvent::PhaseStarted { .. } => "phase_started",
            StatusEvent::ModelDeployed { .. } => "model_deployed",
            StatusEvent::UnitCompleted { .. } => "unit_completed",
            StatusEvent::UnitSkipped { .. } => "unit_skipped",
            StatusEvent::UnitFailed { .. } => "unit_failed",
            StatusEvent::RetryScheduled { .. } => "retry_scheduled",
            StatusEvent::ArtifactWritten { .. } => "artifact_written",
            StatusEvent::ArtifactFailed { .. } => "artifact_failed",
            StatusEvent::RunFinished { .. } => "run_finished",
            StatusEvent::RunAborted { .. } => "run_aborted",
        }
    }
}

/// Receiver of [`StatusEvent`]s. Emitting never fails the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StatusEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &StatusEvent) {}
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StatusEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.events().iter().map(StatusEvent::event_type).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &StatusEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `run_id`, `ts`
/// - the event's own fields are merged last
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn write(&self, event: &StatusEvent) -> anyhow::Result<Value> {
        let mut line_obj = Map::new();
        line_obj.insert(
            "type".to_string(),
            Value::String(event.event_type().to_string()),
        );
        line_obj.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        line_obj.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(fields) = serde_json::to_value(event)? {
            for (key, value) in fields {
                line_obj.insert(key, value);
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&line_obj)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line_obj))
    }
}

impl EventSink for EventWriter {
    fn emit(&self, event: &StatusEvent) {
        if let Err(err) = self.write(event) {
            tracing::warn!(
                path = %self.inner.path.display(),
                event = event.event_type(),
                "failed to append status event: {err:#}"
            );
        }
    }
}

/// Fresh identifier stamped on every line of a run's event log.
pub fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4().simple())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;

    use super::*;

    #[test]
    fn write_produces_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let emitted = writer.write(&StatusEvent::PhaseStarted {
            phase: Phase::Draft,
            model: "anything-v5".to_string(),
            units: 3,
        })?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], "phase_started");
        assert_eq!(parsed["run_id"], "run-123");
        assert_eq!(parsed["phase"], "draft");
        assert_eq!(parsed["units"], 3);

        let ts = parsed["ts"].as_str().unwrap_or("");
        chrono::DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn sink_appends_lines_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        writer.emit(&StatusEvent::RunAborted {
            reason: "one".to_string(),
        });
        writer.emit(&StatusEvent::ArtifactWritten {
            path: "two.png".to_string(),
        });

        let content = fs::read_to_string(&path)?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "run_aborted");
        assert_eq!(lines[1]["type"], "artifact_written");
        assert_eq!(lines[1]["path"], "two.png");
        Ok(())
    }

    #[test]
    fn event_type_matches_serde_tag() -> anyhow::Result<()> {
        let event = StatusEvent::UnitSkipped {
            phase: Phase::Refine,
            unit: "s1_001".to_string(),
            reason: SkipReason::DraftMissing,
        };
        let value = serde_json::to_value(&event)?;
        assert_eq!(value["type"], event.event_type());
        assert_eq!(value["reason"], "draft_missing");
        Ok(())
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
        assert!(new_run_id().starts_with("run-"));
    }
}
