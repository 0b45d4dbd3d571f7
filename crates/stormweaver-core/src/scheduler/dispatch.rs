//! Executing one action against a pooled connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::board::{WorkerBoard, WorkerState};
use crate::action::{Action, ActionRequest};
use crate::backend::{DriverError, DriverSession};
use crate::error::{WeaverError, WeaverResult};
use crate::outcome::{Outcome, OutcomeStatus};
use crate::pool::ConnectionPool;
use crate::recorder::OutcomeRecorder;
use crate::sandbox::{QueryPort, QueryResult};

/// Timing limits applied to every dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatchLimits {
    pub acquire_timeout: Duration,
    pub query_timeout: Duration,
    pub grace_period: Duration,
}

/// Per-worker dispatcher. Owns the worker's sequence counter, so both the
/// actions a sandbox returns and the queries it submits synchronously share
/// one contiguous sequence.
pub(crate) struct Dispatcher {
    run_id: Arc<str>,
    worker: u32,
    default_backend: Arc<str>,
    pool: ConnectionPool,
    recorder: OutcomeRecorder,
    board: WorkerBoard,
    limits: DispatchLimits,
    cancel: CancellationToken,
    runtime: Handle,
    issued: AtomicU64,
    errors: AtomicU64,
}

enum Completion {
    Finished(Box<dyn DriverSession>, QueryResult),
    Panicked(String),
    TimedOut,
    Abandoned,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Arc<str>,
        worker: u32,
        default_backend: Arc<str>,
        pool: ConnectionPool,
        recorder: OutcomeRecorder,
        board: WorkerBoard,
        limits: DispatchLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            worker,
            default_backend,
            pool,
            recorder,
            board,
            limits,
            cancel,
            runtime: Handle::current(),
            issued: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Number of actions issued so far
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Number of issued actions the backend rejected
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Execute `request` and record its outcome.
    ///
    /// Backend rejections are returned as `Ok(Err(..))` and leave the worker
    /// running. Pool failures, query timeouts and cancellation are `Err`.
    pub async fn dispatch(&self, request: ActionRequest) -> WeaverResult<QueryResult> {
        let backend = request
            .backend
            .clone()
            .unwrap_or_else(|| self.default_backend.to_string());

        self.board.set(self.worker, WorkerState::SuspendedForConnection);
        let acquired = self.pool.acquire(&backend, self.limits.acquire_timeout).await;
        self.board.set(self.worker, WorkerState::Running);
        let mut conn = acquired?;

        let sequence = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let action = Action {
            worker: self.worker,
            sequence,
            backend,
            request,
        };
        debug!(
            event = "action_dispatched",
            worker = action.worker,
            sequence = action.sequence,
            backend = %action.backend,
            connection = %conn.id(),
            tag = action.tag().unwrap_or(""),
            "Dispatching action"
        );

        let outcome = Outcome::for_action(
            &self.run_id,
            &action,
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        );
        let Some(mut session) = conn.take_session() else {
            // A guard handed out by the pool always carries a session.
            conn.mark_unhealthy();
            return Err(WeaverError::BackendUnavailable {
                backend: action.backend,
                reason: "connection has no session".into(),
            });
        };

        let started = Instant::now();
        let sql = action.request.sql.clone();
        let params = action.request.params.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            let result = session.execute(&sql, &params);
            (session, result)
        });

        let completion = tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok((session, result)) => Completion::Finished(session, result),
                Err(e) => Completion::Panicked(e.to_string()),
            },
            _ = tokio::time::sleep(self.limits.query_timeout) => Completion::TimedOut,
            _ = self.cancel.cancelled() => {
                match tokio::time::timeout(self.limits.grace_period, &mut handle).await {
                    Ok(Ok((session, result))) => Completion::Finished(session, result),
                    Ok(Err(e)) => Completion::Panicked(e.to_string()),
                    Err(_) => Completion::Abandoned,
                }
            }
        };
        let outcome = outcome.with_duration(started.elapsed());

        match completion {
            Completion::Finished(session, Ok(rows)) => {
                conn.restore_session(session);
                self.recorder.record(outcome.with_rows(&rows));
                Ok(Ok(rows))
            }
            Completion::Finished(session, Err(e)) => {
                conn.restore_session(session);
                if e.connection_lost {
                    warn!(worker = self.worker, sequence, connection = %conn.id(), "Connection lost; evicting");
                    conn.mark_unhealthy();
                }
                self.errors.fetch_add(1, Ordering::SeqCst);
                debug!(worker = self.worker, sequence, error = %e.describe(), "Statement rejected");
                self.recorder
                    .record(outcome.with_failure(OutcomeStatus::Error, e.describe()));
                Ok(Err(e))
            }
            Completion::Panicked(message) => {
                // The session went down with the panicking thread.
                self.errors.fetch_add(1, Ordering::SeqCst);
                let e = DriverError::new(format!("driver panicked: {}", message)).connection_lost();
                self.recorder
                    .record(outcome.with_failure(OutcomeStatus::Error, e.describe()));
                Ok(Err(e))
            }
            Completion::TimedOut => {
                warn!(
                    worker = self.worker,
                    sequence,
                    timeout_ms = self.limits.query_timeout.as_millis() as u64,
                    "Query timed out; abandoning connection"
                );
                self.recorder.record(outcome.with_failure(
                    OutcomeStatus::Timeout,
                    format!("query exceeded {:?}", self.limits.query_timeout),
                ));
                Err(WeaverError::Timeout(self.limits.query_timeout))
            }
            Completion::Abandoned => {
                warn!(worker = self.worker, sequence, "Query still running after grace period; abandoning connection");
                self.recorder.record(
                    outcome.with_failure(OutcomeStatus::Abandoned, "cancelled before completion"),
                );
                Err(WeaverError::Cancelled)
            }
        }
    }
}

impl QueryPort for Dispatcher {
    fn query(&self, request: ActionRequest) -> WeaverResult<QueryResult> {
        tokio::task::block_in_place(|| self.runtime.block_on(self.dispatch(request)))
    }
}
