//! The per-worker loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::board::{FinishReason, WorkerBoard, WorkerState};
use super::dispatch::Dispatcher;
use crate::checker::Invariant;
use crate::error::{WeaverError, WeaverResult};
use crate::random::WorkloadRng;
use crate::sandbox::{Sandbox, SandboxFactory, SessionContext, Step};

/// Terminal report of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker: u32,
    pub variant: usize,
    pub seed: u64,
    /// `finished` or `failed`
    pub state: String,
    #[serde(skip)]
    pub terminal: WorkerState,
    /// Error kind when failed
    pub cause: Option<String>,
    /// Actions issued (equals the highest recorded sequence)
    pub actions: u64,
    /// Issued actions the backend rejected
    pub errors: u64,
    /// Sandbox steps completed
    pub steps: u64,
    pub elapsed_ms: u64,
}

impl WorkerReport {
    fn new(
        worker: u32,
        variant: usize,
        seed: u64,
        terminal: WorkerState,
        dispatcher: &Dispatcher,
        steps: u64,
        elapsed: Duration,
    ) -> Self {
        let cause = match &terminal {
            WorkerState::Failed(e) => Some(e.kind().to_string()),
            _ => None,
        };
        Self {
            worker,
            variant,
            seed,
            state: terminal.label().to_string(),
            terminal,
            cause,
            actions: dispatcher.issued(),
            errors: dispatcher.errors(),
            steps,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Report for a worker whose task died before it could report.
    pub(crate) fn panicked(worker: u32, terminal: WorkerState) -> Self {
        Self {
            worker,
            variant: 0,
            seed: 0,
            state: terminal.label().to_string(),
            cause: match &terminal {
                WorkerState::Failed(e) => Some(e.kind().to_string()),
                _ => None,
            },
            terminal,
            actions: 0,
            errors: 0,
            steps: 0,
            elapsed_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.terminal, WorkerState::Failed(_))
    }

    pub fn error(&self) -> Option<&WeaverError> {
        match &self.terminal {
            WorkerState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Everything one worker task needs.
pub(crate) struct WorkerContext<F: SandboxFactory> {
    pub worker: u32,
    pub variant: usize,
    pub seed: u64,
    pub iterations: Option<u64>,
    pub factory: Arc<F>,
    pub dispatcher: Arc<Dispatcher>,
    pub board: WorkerBoard,
    /// Soft stop: finish at the next step boundary
    pub stop: CancellationToken,
    /// Hard cancellation
    pub cancel: CancellationToken,
}

impl<F: SandboxFactory> WorkerContext<F> {
    fn session(&self) -> SessionContext {
        SessionContext {
            worker: self.worker,
            variant: self.variant,
            queries: Arc::clone(&self.dispatcher) as Arc<dyn crate::sandbox::QueryPort>,
            cancel: self.cancel.clone(),
        }
    }

    fn finish(&self, terminal: WorkerState, steps: u64, started: Instant) -> WorkerReport {
        match &terminal {
            WorkerState::Failed(e) => error!(
                event = "worker_failed",
                worker = self.worker,
                cause = e.kind(),
                error = %e,
                "Worker failed"
            ),
            other => info!(worker = self.worker, state = %other, steps, "Worker finished"),
        }
        self.board.set(self.worker, terminal.clone());
        WorkerReport::new(
            self.worker,
            self.variant,
            self.seed,
            terminal,
            &self.dispatcher,
            steps,
            started.elapsed(),
        )
    }

    /// A cancellation that arrives after the deadline's soft stop is part of
    /// winding down, not a failure of the worker.
    fn classify(&self, e: WeaverError) -> WorkerState {
        if e == WeaverError::Cancelled && self.stop.is_cancelled() {
            WorkerState::Finished(FinishReason::Deadline)
        } else {
            WorkerState::Failed(e)
        }
    }
}

/// Load a sandbox on the blocking-capable worker thread.
fn load<F: SandboxFactory>(ctx: &WorkerContext<F>) -> WeaverResult<F::Sandbox> {
    let session = ctx.session();
    tokio::task::block_in_place(|| ctx.factory.load(session))
}

/// Run one worker until it is terminal. Also returns the invariants its
/// sandbox declared at load.
pub(crate) async fn run_worker<F: SandboxFactory>(
    ctx: WorkerContext<F>,
) -> (WorkerReport, Vec<Invariant>) {
    let started = Instant::now();
    let mut rng = WorkloadRng::new(ctx.seed);

    let mut sandbox = match load(&ctx) {
        Ok(sandbox) => sandbox,
        Err(e) => return (ctx.finish(WorkerState::Failed(e), 0, started), Vec::new()),
    };
    let invariants = sandbox.invariants();
    let report = drive(&ctx, &mut sandbox, &mut rng, started).await;
    (report, invariants)
}

async fn drive<F: SandboxFactory>(
    ctx: &WorkerContext<F>,
    sandbox: &mut F::Sandbox,
    rng: &mut WorkloadRng,
    started: Instant,
) -> WorkerReport {
    info!(
        event = "worker_started",
        worker = ctx.worker,
        variant = ctx.variant,
        seed = ctx.seed,
        "Worker started"
    );
    ctx.board.set(ctx.worker, WorkerState::Running);

    let mut steps = 0u64;
    loop {
        if ctx.cancel.is_cancelled() {
            let state = ctx.classify(WeaverError::Cancelled);
            return ctx.finish(state, steps, started);
        }
        if ctx.stop.is_cancelled() {
            return ctx.finish(WorkerState::Finished(FinishReason::Deadline), steps, started);
        }
        if ctx.iterations.is_some_and(|limit| steps >= limit) {
            return ctx.finish(WorkerState::Finished(FinishReason::IterationLimit), steps, started);
        }

        let step = tokio::task::block_in_place(|| sandbox.step(rng));
        let request = match step {
            Ok(Step::Action(request)) => request,
            Ok(Step::Executed) => {
                steps += 1;
                continue;
            }
            Ok(Step::Done) => {
                return ctx.finish(WorkerState::Finished(FinishReason::ScriptDone), steps, started)
            }
            Err(e) => {
                let state = ctx.classify(e);
                return ctx.finish(state, steps, started);
            }
        };

        if let Err(e) = ctx.dispatcher.dispatch(request).await {
            let state = ctx.classify(e);
            return ctx.finish(state, steps + 1, started);
        }
        steps += 1;
    }
}

/// Run the setup lane: every script variant gets its `setup` called once,
/// in variant order, before any worker starts. Returns the report and the
/// invariants the setup sandboxes declared.
pub(crate) fn run_setup<F: SandboxFactory>(
    ctx: WorkerContext<F>,
    variants: usize,
) -> (WorkerReport, Vec<Invariant>) {
    let started = Instant::now();
    let mut rng = WorkloadRng::new(ctx.seed);
    let mut invariants = Vec::new();
    ctx.board.set(ctx.worker, WorkerState::Running);

    for variant in 0..variants {
        let mut session = ctx.session();
        session.variant = variant;
        let loaded = tokio::task::block_in_place(|| ctx.factory.load(session));
        let mut sandbox = match loaded {
            Ok(sandbox) => sandbox,
            Err(e) => return (ctx.finish(WorkerState::Failed(e), 0, started), invariants),
        };
        invariants.extend(sandbox.invariants());

        if let Err(e) = tokio::task::block_in_place(|| sandbox.setup(&mut rng)) {
            let state = ctx.classify(e);
            return (ctx.finish(state, variant as u64, started), invariants);
        }
    }

    let report = ctx.finish(
        WorkerState::Finished(FinishReason::ScriptDone),
        variants as u64,
        started,
    );
    (report, invariants)
}
