//! Actions produced by sandboxes.

use serde::{Deserialize, Serialize};

use crate::backend::SqlValue;

/// One statement a sandbox wants executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Target backend; the run's default backend when absent
    #[serde(default)]
    pub backend: Option<String>,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
    /// Free-form label invariants refer to ("insert", "select", ...)
    #[serde(default)]
    pub tag: Option<String>,
}

impl ActionRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            backend: None,
            sql: sql.into(),
            params: Vec::new(),
            tag: None,
        }
    }

    pub fn with_params(mut self, params: Vec<SqlValue>) -> Self {
        self.params = params;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// An issued request: the request plus the worker and sequence number it was
/// issued under. Consumed by exactly one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub worker: u32,
    pub sequence: u64,
    pub backend: String,
    pub request: ActionRequest,
}

impl Action {
    pub fn tag(&self) -> Option<&str> {
        self.request.tag.as_deref()
    }
}
