//! Resolved workload configuration.
//!
//! The core never reads configuration files or environment variables itself.
//! Outer layers (the CLI) deserialize a [`WorkloadConfig`] from JSON, apply
//! their overrides and hand the resolved value to the scheduler.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WeaverError, WeaverResult};

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 5;

/// Default number of connections per backend
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default number of consecutive connect attempts before a backend is marked down
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

fn default_name() -> String {
    "workload".to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_grace_period_ms() -> u64 {
    2_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_flush_every() -> usize {
    64
}

/// Configuration for a whole workload run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Human-readable run name, used for log file names
    #[serde(default = "default_name")]
    pub name: String,

    /// Number of concurrent workers (fixed for the run)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum number of steps per worker; unbounded when absent
    #[serde(default)]
    pub iterations: Option<u64>,

    /// Global deadline for the run in milliseconds
    #[serde(default)]
    pub duration_ms: Option<u64>,

    /// Run seed; a random one is drawn (and logged) when absent
    #[serde(default)]
    pub seed: Option<u64>,

    /// How long in-flight queries may keep running after cancellation
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Timeout for a single connection acquisition
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Timeout for a single query execution
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Interval between interim invariant evaluations
    #[serde(default)]
    pub checkpoint_interval_ms: Option<u64>,

    /// Script files; workers are assigned to them round-robin
    #[serde(default)]
    pub scripts: Vec<PathBuf>,

    /// Target database backends
    pub backends: Vec<BackendConfig>,

    /// Backend used by actions that don't name one (first backend if absent)
    #[serde(default)]
    pub default_backend: Option<String>,

    /// JSONL file receiving one record per outcome
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Number of records buffered before the outcome sink is flushed
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// Settings of the built-in random DDL/DML generator
    #[serde(default)]
    pub actions: ActionsConfig,
}

impl WorkloadConfig {
    /// Create a configuration with defaults for everything but the backends.
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            name: default_name(),
            workers: DEFAULT_WORKERS,
            iterations: None,
            duration_ms: None,
            seed: None,
            grace_period_ms: default_grace_period_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            checkpoint_interval_ms: None,
            scripts: Vec::new(),
            backends,
            default_backend: None,
            output: None,
            flush_every: default_flush_every(),
            actions: ActionsConfig::default(),
        }
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> WeaverResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| WeaverError::Config(format!("invalid configuration: {}", e)))?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_actions(mut self, actions: ActionsConfig) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_ms.map(Duration::from_millis)
    }

    /// Name of the backend used when an action doesn't select one.
    pub fn default_backend_name(&self) -> Option<&str> {
        self.default_backend
            .as_deref()
            .or_else(|| self.backends.first().map(|b| b.name.as_str()))
    }

    /// Look up a backend by name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Check the configuration for values the scheduler cannot run with.
    pub fn validate(&self) -> WeaverResult<()> {
        if self.workers == 0 {
            return Err(WeaverError::Config("workers must be at least 1".into()));
        }
        if self.backends.is_empty() {
            return Err(WeaverError::Config(
                "at least one backend must be configured".into(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(WeaverError::Config("backend name must not be empty".into()));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(WeaverError::Config(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if backend.pool_size == 0 {
                return Err(WeaverError::Config(format!(
                    "backend '{}': pool_size must be at least 1",
                    backend.name
                )));
            }
        }

        if let Some(default) = &self.default_backend {
            if self.backend(default).is_none() {
                return Err(WeaverError::Config(format!(
                    "default_backend '{}' is not a configured backend",
                    default
                )));
            }
        }

        if self.flush_every == 0 {
            return Err(WeaverError::Config("flush_every must be at least 1".into()));
        }

        self.actions.validate()
    }
}

/// Settings of the built-in random action generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Weight overrides by action name (`create_normal_table`, `insert_some_data`, ...)
    pub weights: BTreeMap<String, u64>,

    pub ddl: DdlConfig,

    pub dml: DmlConfig,

    /// Tables the setup lane creates (and fills) before workers start
    pub initial_tables: usize,
}

impl ActionsConfig {
    pub fn with_weight(mut self, action: impl Into<String>, weight: u64) -> Self {
        self.weights.insert(action.into(), weight);
        self
    }

    pub fn with_initial_tables(mut self, count: usize) -> Self {
        self.initial_tables = count;
        self
    }

    /// Check limits and weights; unknown action names are rejected.
    pub fn validate(&self) -> WeaverResult<()> {
        let ddl = &self.ddl;
        if ddl.min_table_count > ddl.max_table_count {
            return Err(WeaverError::Config(
                "actions.ddl: min_table_count exceeds max_table_count".into(),
            ));
        }
        if ddl.max_table_count > crate::schema::DEFAULT_TABLE_CAPACITY {
            return Err(WeaverError::Config(format!(
                "actions.ddl: max_table_count is limited to {}",
                crate::schema::DEFAULT_TABLE_CAPACITY
            )));
        }
        if ddl.max_column_count < 2 {
            return Err(WeaverError::Config(
                "actions.ddl: max_column_count must be at least 2".into(),
            ));
        }
        if ddl.max_alter_clauses == 0 {
            return Err(WeaverError::Config(
                "actions.ddl: max_alter_clauses must be at least 1".into(),
            ));
        }

        let dml = &self.dml;
        if dml.delete_min > dml.delete_max {
            return Err(WeaverError::Config(
                "actions.dml: delete_min exceeds delete_max".into(),
            ));
        }
        for (field, rows) in [
            ("insert_rows", dml.insert_rows),
            ("initial_batch_rows", dml.initial_batch_rows),
        ] {
            if rows == 0 || rows > MAX_INSERT_ROWS {
                return Err(WeaverError::Config(format!(
                    "actions.dml: {} must be between 1 and {}",
                    field, MAX_INSERT_ROWS
                )));
            }
        }

        crate::generator::ActionLibrary::from_config(self).map(|_| ())
    }
}

/// Most rows a single generated INSERT carries
pub const MAX_INSERT_ROWS: usize = 1_000;

/// Limits for generated DDL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdlConfig {
    /// DROP TABLE is skipped at or below this many tables
    pub min_table_count: usize,
    /// CREATE TABLE is skipped at or above this many tables
    pub max_table_count: usize,
    pub max_column_count: usize,
    /// ALTER TABLE runs between one and this many clauses
    pub max_alter_clauses: usize,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            min_table_count: 3,
            max_table_count: 10,
            max_column_count: 20,
            max_alter_clauses: 5,
        }
    }
}

/// Sizes of generated DML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmlConfig {
    /// Rows per `insert_some_data`
    pub insert_rows: usize,
    /// Row count range of `delete_some_data`
    pub delete_min: u64,
    pub delete_max: u64,
    /// INSERT statements per table when generating initial data
    pub initial_batches: usize,
    pub initial_batch_rows: usize,
}

impl Default for DmlConfig {
    fn default() -> Self {
        Self {
            insert_rows: 10,
            delete_min: 1,
            delete_max: 10,
            initial_batches: 10,
            initial_batch_rows: 100,
        }
    }
}

/// Configuration for one target backend and its connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Name scripts use to select this backend
    pub name: String,

    /// Fixed number of connections in the pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Consecutive failed connect attempts tolerated before the backend is marked down
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Statements executed on every freshly opened connection
    #[serde(default)]
    pub init_sql: Vec<String>,

    /// Driver selection and driver-specific settings
    #[serde(flatten)]
    pub driver: DriverConfig,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, driver: DriverConfig) -> Self {
        Self {
            name: name.into(),
            pool_size: DEFAULT_POOL_SIZE,
            retry_budget: DEFAULT_RETRY_BUDGET,
            init_sql: Vec::new(),
            driver,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_init_sql(mut self, sql: impl Into<String>) -> Self {
        self.init_sql.push(sql.into());
        self
    }
}

/// Driver-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DriverConfig {
    /// SQLite database file (or `:memory:`)
    Sqlite { path: String },

    /// In-process simulator, for dry runs of scripts
    Sim {
        /// Latency added to every statement
        #[serde(default)]
        latency_ms: u64,
        /// Refuse every connection attempt
        #[serde(default)]
        refuse_connections: bool,
    },
}
