//! Workload scheduler.
//!
//! Spawns a fixed number of workers, each driving its own sandbox against the
//! shared connection pool, and supervises them until every worker is
//! terminal. Supervision covers three timers:
//!
//! - the run deadline, a soft stop observed at the next step boundary
//! - escalation to hard cancellation once the grace period after the deadline
//!   has passed
//! - optional checkpoints evaluating invariants over the outcomes so far
//!
//! Requires a multi-threaded tokio runtime: sandbox steps run inside
//! `block_in_place` so scripts can submit synchronous queries.

mod board;
mod dispatch;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

pub use board::{FinishReason, WorkerBoard, WorkerState};
pub use worker::WorkerReport;

use crate::backend::{driver_for, Driver};
use crate::checker::{evaluate, Invariant, Violation};
use crate::config::WorkloadConfig;
use crate::error::{WeaverError, WeaverResult};
use crate::outcome::Outcome;
use crate::pool::ConnectionPool;
use crate::random::{derive_seed, random_run_seed};
use crate::recorder::OutcomeRecorder;
use crate::sandbox::SandboxFactory;
use dispatch::{DispatchLimits, Dispatcher};
use worker::{run_setup, run_worker, WorkerContext};

/// Result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub name: String,
    pub seed: u64,
    pub started_at: String,
    pub elapsed_ms: u64,
    /// Setup lane report, when the factory ran a setup
    pub setup: Option<WorkerReport>,
    pub workers: Vec<WorkerReport>,
    /// Names of every evaluated invariant
    pub invariants: Vec<String>,
    pub violations: Vec<Violation>,
    /// The run was cancelled from outside (not by its own deadline)
    pub cancelled: bool,
    /// Persisting outcomes failed
    pub recorder_error: Option<String>,
    #[serde(skip)]
    pub outcomes: Vec<Outcome>,
}

impl RunSummary {
    /// The run succeeded when no worker failed, no violation was found and
    /// every outcome was persisted.
    pub fn is_success(&self) -> bool {
        self.failed_workers().next().is_none()
            && self.violations.is_empty()
            && self.recorder_error.is_none()
    }

    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerReport> {
        self.setup
            .iter()
            .chain(self.workers.iter())
            .filter(|r| r.is_failed())
    }

    /// Every reason the run failed: terminal worker errors first, then one
    /// `InvariantViolation` per violation.
    pub fn failure_causes(&self) -> Vec<WeaverError> {
        self.failed_workers()
            .filter_map(|r| r.error().cloned())
            .chain(self.violations.iter().map(WeaverError::from))
            .collect()
    }

    pub fn total_actions(&self) -> u64 {
        self.setup
            .iter()
            .chain(self.workers.iter())
            .map(|r| r.actions)
            .sum()
    }
}

/// Runs a workload described by a [`WorkloadConfig`].
pub struct Scheduler {
    config: WorkloadConfig,
    cancel: CancellationToken,
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl Scheduler {
    /// Validate `config` and create a scheduler for it.
    pub fn new(config: WorkloadConfig) -> WeaverResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            drivers: HashMap::new(),
        })
    }

    /// Use an externally owned cancellation token (e.g. wired to Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the driver built from the configuration of `backend`.
    pub fn with_driver(mut self, backend: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(backend.into(), driver);
        self
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the workload to completion.
    ///
    /// Errors are reserved for setup problems (runtime flavor, unwritable
    /// outcome sink). Everything that goes wrong inside the run lands in the
    /// returned summary.
    pub async fn run<F: SandboxFactory>(&self, factory: Arc<F>) -> WeaverResult<RunSummary> {
        if Handle::current().runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(WeaverError::Config(
                "the scheduler needs a multi-threaded tokio runtime".into(),
            ));
        }

        let config = &self.config;
        let run_id = Ulid::new().to_string();
        let seed = config.seed.unwrap_or_else(random_run_seed);
        let started_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let started = Instant::now();
        let default_backend: Arc<str> = Arc::from(config.default_backend_name().unwrap_or_default());

        info!(
            run_id = %run_id,
            name = %config.name,
            seed,
            workers = config.workers,
            backends = config.backends.len(),
            "Starting workload run"
        );

        let recorder = OutcomeRecorder::start(config.output.as_deref(), config.flush_every)?;
        let pool = ConnectionPool::with_drivers(
            config
                .backends
                .iter()
                .map(|b| {
                    let driver = self
                        .drivers
                        .get(&b.name)
                        .cloned()
                        .unwrap_or_else(|| driver_for(&b.driver));
                    (b.clone(), driver)
                })
                .collect(),
            self.cancel.clone(),
        );

        let worker_ids = 1..=config.workers as u32;
        let board = WorkerBoard::new(std::iter::once(0).chain(worker_ids.clone()));
        let stop = CancellationToken::new();
        let limits = DispatchLimits {
            acquire_timeout: config.acquire_timeout(),
            query_timeout: config.query_timeout(),
            grace_period: config.grace_period(),
        };
        let run_id_shared: Arc<str> = Arc::from(run_id.as_str());
        let context = |worker: u32, variant: usize| WorkerContext {
            worker,
            variant,
            seed: derive_seed(seed, worker),
            iterations: config.iterations,
            factory: Arc::clone(&factory),
            dispatcher: Arc::new(Dispatcher::new(
                Arc::clone(&run_id_shared),
                worker,
                Arc::clone(&default_backend),
                pool.clone(),
                recorder.clone(),
                board.clone(),
                limits,
                self.cancel.clone(),
            )),
            board: board.clone(),
            stop: stop.clone(),
            cancel: self.cancel.clone(),
        };

        // Setup lane runs to completion before the workers start.
        let variants = factory.variants().max(1);
        let (setup_report, mut declared) = run_setup(context(0, 0), variants);
        let setup_failed = setup_report.is_failed();
        let setup = (setup_report.actions > 0 || setup_failed).then_some(setup_report);

        let mut workers = Vec::new();
        let mut outcomes: Vec<Outcome> = Vec::new();
        if !setup_failed {
            let handles: Vec<_> = worker_ids
                .map(|worker| {
                    let ctx = context(worker, (worker as usize - 1) % variants);
                    tokio::spawn(run_worker(ctx))
                })
                .collect();

            let (reports, invariants, accumulated) = self
                .supervise(handles, &recorder, &declared, &board, &stop)
                .await;
            workers = reports;
            declared.extend(invariants);
            outcomes = accumulated;
        } else {
            warn!("Setup lane failed; no workers started");
        }

        outcomes.extend(recorder.drain().await);
        let recorder_error = match recorder.close().await {
            Ok(stats) => {
                debug!(recorded = stats.recorded, persisted = stats.persisted, "Recorder closed");
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to persist outcomes");
                Some(e.to_string())
            }
        };
        pool.shutdown().await;

        let invariants = effective_invariants(declared);
        let violations = evaluate(&invariants, &outcomes);
        for violation in &violations {
            warn!(
                event = "violation",
                invariant = %violation.invariant,
                outcomes = ?violation.outcomes,
                explanation = %violation.explanation,
                "Invariant violated"
            );
        }

        let summary = RunSummary {
            run_id,
            name: config.name.clone(),
            seed,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            setup,
            workers,
            invariants: invariants.iter().map(|i| i.name.clone()).collect(),
            violations,
            cancelled: self.cancel.is_cancelled() && !stop.is_cancelled(),
            recorder_error,
            outcomes,
        };
        info!(
            run_id = %summary.run_id,
            actions = summary.total_actions(),
            violations = summary.violations.len(),
            success = summary.is_success(),
            elapsed_ms = summary.elapsed_ms,
            "Workload run complete"
        );
        Ok(summary)
    }

    /// Wait for every worker, driving the deadline, escalation and
    /// checkpoint timers in the meantime.
    async fn supervise(
        &self,
        handles: Vec<tokio::task::JoinHandle<(WorkerReport, Vec<Invariant>)>>,
        recorder: &OutcomeRecorder,
        declared: &[Invariant],
        board: &WorkerBoard,
        stop: &CancellationToken,
    ) -> (Vec<WorkerReport>, Vec<Invariant>, Vec<Outcome>) {
        let worker_ids: Vec<u32> = (1..=handles.len() as u32).collect();
        let mut joined = std::pin::pin!(futures::future::join_all(handles));

        let far_future = Duration::from_secs(60 * 60 * 24 * 365);
        let deadline = tokio::time::sleep(self.config.deadline().unwrap_or(far_future));
        tokio::pin!(deadline);
        let escalation = tokio::time::sleep(far_future);
        tokio::pin!(escalation);
        let mut checkpoint = self
            .config
            .checkpoint_interval()
            .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));

        // Outcomes drained at checkpoints; returned so the final evaluation
        // sees everything.
        let mut seen: Vec<Outcome> = Vec::new();
        let invariants = effective_invariants(declared.to_vec());

        let results = loop {
            tokio::select! {
                results = &mut joined => break results,
                _ = &mut deadline, if !stop.is_cancelled() => {
                    info!(board = ?board.summary(), "Deadline reached; stopping workers");
                    stop.cancel();
                    escalation
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.config.grace_period());
                }
                _ = &mut escalation, if stop.is_cancelled() && !self.cancel.is_cancelled() => {
                    warn!(board = ?board.summary(), "Workers still busy after grace period; cancelling");
                    self.cancel.cancel();
                }
                _ = async {
                    match checkpoint.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    seen.extend(recorder.drain().await);
                    for violation in evaluate(&invariants, &seen) {
                        warn!(
                            invariant = %violation.invariant,
                            explanation = %violation.explanation,
                            "Interim invariant violation"
                        );
                    }
                    debug!(outcomes = seen.len(), board = ?board.summary(), "Checkpoint evaluated");
                }
            }
        };

        let mut reports = Vec::with_capacity(results.len());
        let mut declared_by_workers = Vec::new();
        for (worker, result) in worker_ids.into_iter().zip(results) {
            match result {
                Ok((report, declared)) => {
                    reports.push(report);
                    declared_by_workers.extend(declared);
                }
                Err(e) => {
                    error!(event = "worker_failed", worker, error = %e, "Worker task panicked");
                    let failure = WorkerState::Failed(WeaverError::ScriptRuntimeFailed(format!(
                        "worker task panicked: {}",
                        e
                    )));
                    board.set(worker, failure.clone());
                    reports.push(WorkerReport::panicked(worker, failure));
                }
            }
        }
        (reports, declared_by_workers, seen)
    }
}

/// Sequence integrity first, then declarations in order, deduplicated by
/// name with the first declaration winning.
fn effective_invariants(declared: Vec<Invariant>) -> Vec<Invariant> {
    let mut seen = HashSet::new();
    std::iter::once(Invariant::sequence_integrity())
        .chain(declared)
        .filter(|i| seen.insert(i.name.clone()))
        .collect()
}
