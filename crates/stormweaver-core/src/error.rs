//! Error types for Stormweaver

use std::time::Duration;

use thiserror::Error;

/// Main error type for Stormweaver operations
///
/// The first eight variants form the workload taxonomy: every terminal worker
/// state carries one of them. The remaining variants cover the ambient
/// plumbing (configuration, I/O, serialization).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeaverError {
    /// Every connection of the backend stayed checked out until the acquire timeout
    #[error("Pool exhausted: no connection for backend '{backend}' within {waited:?}")]
    PoolExhausted { backend: String, waited: Duration },

    /// The backend could not be reached within the reconnect budget
    #[error("Backend unavailable: {backend}: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The script failed to compile or its top-level chunk raised an error
    #[error("Script load failed: {0}")]
    ScriptLoadFailed(String),

    /// The script raised an error while producing an action
    #[error("Script runtime error: {0}")]
    ScriptRuntimeFailed(String),

    /// The database rejected a statement
    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// A query exceeded its execution timeout
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled while this operation was pending
    #[error("Cancelled")]
    Cancelled,

    /// A declared invariant did not hold
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl WeaverError {
    /// Short machine-readable name of the error kind, used in reports and
    /// structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            WeaverError::PoolExhausted { .. } => "pool_exhausted",
            WeaverError::BackendUnavailable { .. } => "backend_unavailable",
            WeaverError::ScriptLoadFailed(_) => "script_load_failed",
            WeaverError::ScriptRuntimeFailed(_) => "script_runtime_failed",
            WeaverError::QueryExecution(_) => "query_execution_error",
            WeaverError::Timeout(_) => "timeout",
            WeaverError::Cancelled => "cancelled",
            WeaverError::InvariantViolation(_) => "invariant_violation",
            WeaverError::Config(_) => "config",
            WeaverError::Io(_) => "io",
            WeaverError::Serialization(_) => "serialization",
        }
    }

    /// Whether the error came from the script rather than the host.
    pub fn is_script_error(&self) -> bool {
        matches!(
            self,
            WeaverError::ScriptLoadFailed(_) | WeaverError::ScriptRuntimeFailed(_)
        )
    }
}

impl From<std::io::Error> for WeaverError {
    fn from(e: std::io::Error) -> Self {
        WeaverError::Io(e.to_string())
    }
}

impl From<crate::backend::DriverError> for WeaverError {
    fn from(e: crate::backend::DriverError) -> Self {
        WeaverError::QueryExecution(e.describe())
    }
}

impl From<serde_json::Error> for WeaverError {
    fn from(e: serde_json::Error) -> Self {
        WeaverError::Serialization(e.to_string())
    }
}

/// Result type for Stormweaver operations
pub type WeaverResult<T> = Result<T, WeaverError>;
