//! Sandbox abstraction.
//!
//! A sandbox is the per-worker script instance. The scheduler never sees a
//! script language: it asks a [`SandboxFactory`] for one [`Sandbox`] per
//! worker and calls [`Sandbox::step`] until the sandbox is done. Sandboxes
//! reach the database only through the [`QueryPort`] in their
//! [`SessionContext`]; connection handles never cross this boundary.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::action::ActionRequest;
use crate::backend::{DriverError, Rows};
use crate::checker::Invariant;
use crate::error::WeaverResult;
use crate::generator::RandomGenerator;
use crate::random::WorkloadRng;

/// Result of a synchronous script query: rows, or the backend's rejection.
pub type QueryResult = Result<Rows, DriverError>;

/// What a sandbox produced for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Action(ActionRequest),
    /// The step ran its statements through the query port itself
    Executed,
    Done,
}

/// Synchronous query submission, executed through the pool.
///
/// Every query is an issued action: it gets the worker's next sequence number
/// and its outcome is recorded. A backend rejection comes back as
/// `Ok(Err(..))`; pool exhaustion, timeouts and cancellation are `Err` and
/// must end the step.
pub trait QueryPort: Send + Sync {
    fn query(&self, request: ActionRequest) -> WeaverResult<QueryResult>;
}

/// Everything a sandbox is given when it is created.
#[derive(Clone)]
pub struct SessionContext {
    /// Worker id; 0 is the setup lane
    pub worker: u32,
    /// Which of the factory's script variants this worker runs
    pub variant: usize,
    pub queries: Arc<dyn QueryPort>,
    /// Fires when the run is cancelled; long running script code must stop
    pub cancel: CancellationToken,
}

/// One isolated script instance. Never shared between workers and never
/// called concurrently.
pub trait Sandbox: Send {
    /// Run the script's one-time setup. Only called on the setup lane.
    fn setup(&mut self, _rng: &mut WorkloadRng) -> WeaverResult<()> {
        Ok(())
    }

    /// Produce the next action, or `Done`.
    fn step(&mut self, rng: &mut WorkloadRng) -> WeaverResult<Step>;

    /// Invariants declared when the script was loaded.
    fn invariants(&self) -> Vec<Invariant>;
}

/// Creates sandboxes for workers.
pub trait SandboxFactory: Send + Sync + 'static {
    type Sandbox: Sandbox + 'static;

    /// Number of distinct scripts; workers are assigned round-robin.
    fn variants(&self) -> usize {
        1
    }

    fn load(&self, session: SessionContext) -> WeaverResult<Self::Sandbox>;
}

type StepFn = dyn Fn(u32, u64, &mut WorkloadRng) -> Option<ActionRequest> + Send + Sync;

/// Programmatic workload without a script language.
///
/// Each worker either replays a fixed list of requests, calls a closure
/// with `(worker, iteration, rng)` until it returns `None`, or runs weighted
/// random actions from a shared [`RandomGenerator`] until the run stops it.
#[derive(Clone)]
pub struct ScriptedFactory {
    plan: Plan,
    setup: Vec<ActionRequest>,
    invariants: Vec<Invariant>,
}

#[derive(Clone)]
enum Plan {
    Requests(Arc<Vec<ActionRequest>>),
    Generator(Arc<StepFn>),
    Random(Arc<RandomGenerator>),
}

impl ScriptedFactory {
    /// Every worker issues `requests` once, in order.
    pub fn from_requests(requests: Vec<ActionRequest>) -> Self {
        Self {
            plan: Plan::Requests(Arc::new(requests)),
            setup: Vec::new(),
            invariants: Vec::new(),
        }
    }

    pub fn from_fn<F>(step: F) -> Self
    where
        F: Fn(u32, u64, &mut WorkloadRng) -> Option<ActionRequest> + Send + Sync + 'static,
    {
        Self {
            plan: Plan::Generator(Arc::new(step)),
            setup: Vec::new(),
            invariants: Vec::new(),
        }
    }

    /// Every step runs one weighted random action. The setup lane creates
    /// and fills the generator's configured initial tables.
    pub fn random(generator: Arc<RandomGenerator>) -> Self {
        Self {
            plan: Plan::Random(generator),
            setup: Vec::new(),
            invariants: Vec::new(),
        }
    }

    /// Statements run through the query port on the setup lane.
    pub fn with_setup(mut self, setup: Vec<ActionRequest>) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_invariant(mut self, invariant: Invariant) -> Self {
        self.invariants.push(invariant);
        self
    }
}

impl SandboxFactory for ScriptedFactory {
    type Sandbox = ScriptedSandbox;

    fn load(&self, session: SessionContext) -> WeaverResult<ScriptedSandbox> {
        Ok(ScriptedSandbox {
            factory: self.clone(),
            session,
            iteration: 0,
        })
    }
}

pub struct ScriptedSandbox {
    factory: ScriptedFactory,
    session: SessionContext,
    iteration: u64,
}

impl Sandbox for ScriptedSandbox {
    /// Runs the setup statements in order; the first rejected one fails the
    /// setup lane. A random plan then creates its initial tables.
    fn setup(&mut self, rng: &mut WorkloadRng) -> WeaverResult<()> {
        for request in &self.factory.setup {
            if let Err(e) = self.session.queries.query(request.clone())? {
                tracing::warn!(sql = %request.sql, error = %e.describe(), "Setup statement failed");
                return Err(e.into());
            }
        }

        if let Plan::Random(generator) = &self.factory.plan {
            let wanted = generator.config().initial_tables;
            if wanted > 0 {
                let port = self.session.queries.as_ref();
                let created = generator.create_random_tables(wanted, rng, port)?;
                let batches = generator.generate_initial_data(rng, port)?;
                tracing::info!(tables = created, batches, "Initial tables created");
            }
        }
        Ok(())
    }

    fn step(&mut self, rng: &mut WorkloadRng) -> WeaverResult<Step> {
        let iteration = self.iteration;
        self.iteration += 1;

        let next = match &self.factory.plan {
            Plan::Requests(requests) => requests.get(iteration as usize).cloned(),
            Plan::Generator(step) => step(self.session.worker, iteration, rng),
            Plan::Random(generator) => {
                generator.random_action(rng, self.session.queries.as_ref())?;
                return Ok(Step::Executed);
            }
        };
        Ok(next.map_or(Step::Done, Step::Action))
    }

    fn invariants(&self) -> Vec<Invariant> {
        self.factory.invariants.clone()
    }
}
