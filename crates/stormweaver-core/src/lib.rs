//! Stormweaver Core Library
//!
//! Scriptable, concurrent SQL workload engine.
//!
//! ## Overview
//!
//! A fixed number of workers each drive their own script sandbox. Every step
//! a sandbox produces an action, the worker dispatches it against a pooled
//! connection and the outcome is recorded. When the run ends, the invariants
//! the scripts declared are evaluated over everything that was recorded.
//!
//! ```text
//! Scheduler ──▶ Sandbox ──▶ ConnectionPool ──▶ OutcomeRecorder ──▶ checker::evaluate
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stormweaver_core::{ActionRequest, BackendConfig, DriverConfig, Scheduler, ScriptedFactory, WorkloadConfig};
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = BackendConfig::new("main", DriverConfig::Sqlite { path: "load.db".into() });
//!     let config = WorkloadConfig::new(vec![backend]).with_workers(4).with_iterations(100);
//!
//!     let factory = ScriptedFactory::from_fn(|worker, i, rng| {
//!         Some(ActionRequest::new("INSERT INTO t VALUES (?1, ?2)")
//!             .with_params(vec![(worker as i64).into(), rng.int_range(0, i as i64).into()])
//!             .with_tag("insert"))
//!     });
//!
//!     let summary = Scheduler::new(config)?.run(Arc::new(factory)).await?;
//!     println!("{} actions, success: {}", summary.total_actions(), summary.is_success());
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod backend;
pub mod checker;
pub mod config;
pub mod error;
pub mod generator;
pub mod logging;
pub mod outcome;
pub mod pool;
pub mod random;
pub mod recorder;
pub mod report;
pub mod sandbox;
pub mod scheduler;
pub mod schema;

// Re-exports
pub use action::{Action, ActionRequest};
pub use backend::{Driver, DriverError, DriverSession, Rows, SimDriver, SqlValue, SqliteDriver};
pub use checker::{evaluate, Invariant, InvariantRule, Measure, Violation};
pub use config::{ActionsConfig, BackendConfig, DdlConfig, DmlConfig, DriverConfig, WorkloadConfig};
pub use error::{WeaverError, WeaverResult};
pub use generator::{ActionKind, ActionReport, ActionStatus, RandomGenerator};
pub use outcome::{Outcome, OutcomeRef, OutcomeStatus};
pub use pool::{BackendStats, ConnectionId, ConnectionPool, PooledConnection};
pub use random::{WeightOverflow, WorkloadRng};
pub use recorder::{read_outcomes, OutcomeRecorder};
pub use sandbox::{QueryPort, QueryResult, Sandbox, SandboxFactory, ScriptedFactory, SessionContext, Step};
pub use scheduler::{FinishReason, RunSummary, Scheduler, WorkerReport, WorkerState};
pub use schema::{Column, ColumnType, Schema, Table};
