//! Outcome records.
//!
//! One [`Outcome`] is produced per dispatched action and never changes after
//! it reaches the recorder. The serialized form is the persisted JSONL record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::backend::{Rows, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    /// The backend rejected the statement
    Error,
    /// The statement exceeded the query timeout
    Timeout,
    /// The run was cancelled and the statement did not finish within the grace period
    Abandoned,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Timeout => "timeout",
            OutcomeStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub run_id: String,
    pub worker: u32,
    pub sequence: u64,
    pub backend: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
    pub status: OutcomeStatus,
    pub row_count: u64,
    pub affected: u64,
    /// BLAKE3 digest of the returned rows, for successful statements
    #[serde(default)]
    pub digest: Option<String>,
    pub duration_us: u64,
    /// RFC 3339 timestamp of dispatch
    pub started_at: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl Outcome {
    /// Start an outcome for `action`; the status fields are filled in by one
    /// of the `with_*` finishers.
    pub fn for_action(run_id: &str, action: &Action, started_at: String) -> Self {
        Self {
            run_id: run_id.to_string(),
            worker: action.worker,
            sequence: action.sequence,
            backend: action.backend.clone(),
            tag: action.request.tag.clone(),
            sql: action.request.sql.clone(),
            params: action.request.params.clone(),
            status: OutcomeStatus::Abandoned,
            row_count: 0,
            affected: 0,
            digest: None,
            duration_us: 0,
            started_at,
            error: None,
        }
    }

    pub fn with_rows(mut self, rows: &Rows) -> Self {
        self.status = OutcomeStatus::Success;
        self.row_count = rows.row_count();
        self.affected = rows.affected;
        self.digest = Some(rows.digest());
        self
    }

    pub fn with_failure(mut self, status: OutcomeStatus, error: impl Into<String>) -> Self {
        self.status = status;
        self.error = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_us = duration.as_micros() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }

    pub fn reference(&self) -> OutcomeRef {
        OutcomeRef {
            worker: self.worker,
            sequence: self.sequence,
        }
    }
}

/// Identifies one outcome by its originating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutcomeRef {
    pub worker: u32,
    pub sequence: u64,
}

impl fmt::Display for OutcomeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}#{}", self.worker, self.sequence)
    }
}
