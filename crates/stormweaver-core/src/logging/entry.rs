//! Log entry types for JSONL-based logging.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single log entry in JSONL format.
///
/// Each entry is self-contained, so a log file is valid after any number of
/// appended lines and can be queried with `jq` line by line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// ISO 8601 timestamp (e.g., "2026-01-21T14:30:45.123Z")
    pub ts: String,

    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log stream name, normally the workload name
    pub stream: String,

    /// Module path / target (e.g., "stormweaver_core::pool")
    pub target: String,

    /// Human-readable message
    pub msg: String,

    /// Structured event fields (worker, sequence, event, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Span path if this entry is from within a span
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    pub fn new(
        level: impl Into<String>,
        stream: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            stream: stream.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Structured `event` field, e.g. `worker_started`
    pub fn event(&self) -> Option<&str> {
        self.fields.as_ref()?.get("event")?.as_str()
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Metadata written once per run next to the raw logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub name: String,
    pub seed: u64,
    pub started_at: String,
    pub workers: usize,
    pub backends: Vec<String>,
    pub scripts: Vec<String>,
    /// Working directory
    pub cwd: Option<String>,
}

impl RunMetadata {
    pub fn new(run_id: impl Into<String>, name: impl Into<String>, seed: u64) -> Self {
        Self {
            run_id: run_id.into(),
            name: name.into(),
            seed,
            started_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            workers: 0,
            backends: Vec::new(),
            scripts: Vec::new(),
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_serialization() {
        let entry = JsonLogEntry::new("info", "nightly", "stormweaver_core::pool", "Opened connection");

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"stream\":\"nightly\""));
        assert!(!json.contains("\"fields\""));

        let parsed = JsonLogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed.msg, "Opened connection");
    }

    #[test]
    fn test_event_field() {
        let entry = JsonLogEntry::new("info", "nightly", "t", "Worker started")
            .with_fields(serde_json::json!({ "event": "worker_started", "worker": 3 }));

        assert_eq!(entry.event(), Some("worker_started"));
        assert!(entry.to_json_line().unwrap().contains("\"worker\":3"));
    }
}
