//! Database client collaborators.
//!
//! The core treats every backend as an opaque "execute a statement, get rows
//! or an error" service. A [`Driver`] opens [`DriverSession`]s; the pool owns
//! the sessions and lends them to workers. Sessions are synchronous and are
//! always driven from the blocking thread pool.

pub mod sim;
pub mod sqlite;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DriverConfig;

pub use sim::{SimDriver, SimStats};
pub use sqlite::SqliteDriver;

/// A single SQL value, used for statement parameters and result cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Render the value the way it appears in logs and script results.
    pub fn to_display(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(f) => f.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Blob(b) => format!("x'{}'", hex::encode(b)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// Result set of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    /// Column names, empty for statements without a result set
    pub columns: Vec<String>,
    /// Returned rows
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows changed by a DML statement
    pub affected: u64,
}

impl Rows {
    /// A result for a statement that changed `affected` rows and returned none.
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    /// BLAKE3 digest of the result payload, hex encoded.
    ///
    /// Every value is prefixed with a type tag and length so that
    /// differently typed or split values never hash alike.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.columns.len() as u64).to_le_bytes());
        for column in &self.columns {
            hasher.update(&(column.len() as u64).to_le_bytes());
            hasher.update(column.as_bytes());
        }
        hasher.update(&self.affected.to_le_bytes());
        for row in &self.rows {
            hasher.update(&[0xfe]);
            for value in row {
                match value {
                    SqlValue::Null => {
                        hasher.update(&[0]);
                    }
                    SqlValue::Integer(i) => {
                        hasher.update(&[1]);
                        hasher.update(&i.to_le_bytes());
                    }
                    SqlValue::Real(f) => {
                        hasher.update(&[2]);
                        hasher.update(&f.to_bits().to_le_bytes());
                    }
                    SqlValue::Text(s) => {
                        hasher.update(&[3]);
                        hasher.update(&(s.len() as u64).to_le_bytes());
                        hasher.update(s.as_bytes());
                    }
                    SqlValue::Blob(b) => {
                        hasher.update(&[4]);
                        hasher.update(&(b.len() as u64).to_le_bytes());
                        hasher.update(b);
                    }
                }
            }
        }
        hex::encode(hasher.finalize().as_bytes())
    }
}

/// Error reported by a driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct DriverError {
    /// Backend-specific error code, when the backend reports one
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
    /// The session is no longer usable and must be evicted
    pub connection_lost: bool,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            connection_lost: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn connection_lost(mut self) -> Self {
        self.connection_lost = true;
        self
    }

    /// Message including the code, as recorded in outcomes.
    pub fn describe(&self) -> String {
        match &self.code {
            Some(code) => format!("{} {}", code, self.message),
            None => self.message.clone(),
        }
    }
}

/// An open connection to a backend.
pub trait DriverSession: Send {
    /// Execute one statement with positional parameters.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Rows, DriverError>;
}

/// Factory of sessions for one backend.
pub trait Driver: Send + Sync {
    /// Driver kind, e.g. `sqlite`
    fn kind(&self) -> &'static str;

    /// Open a new session. Blocking.
    fn connect(&self) -> Result<Box<dyn DriverSession>, DriverError>;
}

/// Build the driver described by a backend configuration.
pub fn driver_for(config: &DriverConfig) -> Arc<dyn Driver> {
    match config {
        DriverConfig::Sqlite { path } => Arc::new(SqliteDriver::new(path.clone())),
        DriverConfig::Sim {
            latency_ms,
            refuse_connections,
        } => {
            let driver = SimDriver::new(std::time::Duration::from_millis(*latency_ms));
            driver.set_refuse_connections(*refuse_connections);
            Arc::new(driver)
        }
    }
}
