//! Worker lifecycle states.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::WeaverError;

/// Why a worker finished normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The sandbox returned Done
    ScriptDone,
    /// The configured number of iterations was reached
    IterationLimit,
    /// The run deadline elapsed
    Deadline,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FinishReason::ScriptDone => "script done",
            FinishReason::IterationLimit => "iteration limit",
            FinishReason::Deadline => "deadline",
        })
    }
}

/// `Idle → Running → (SuspendedForConnection ↔ Running) → Finished | Failed`
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Idle,
    Running,
    SuspendedForConnection,
    Finished(FinishReason),
    Failed(WeaverError),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Finished(_) | WorkerState::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::SuspendedForConnection => "suspended_for_connection",
            WorkerState::Finished(_) => "finished",
            WorkerState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Finished(reason) => write!(f, "finished ({})", reason),
            WorkerState::Failed(e) => write!(f, "failed: {}", e),
            other => f.write_str(other.label()),
        }
    }
}

/// Shared view of every worker's current state.
///
/// Written by the workers themselves, read by the scheduler's monitor loop.
/// Terminal states are sticky.
#[derive(Clone, Default)]
pub struct WorkerBoard {
    states: Arc<RwLock<BTreeMap<u32, WorkerState>>>,
}

impl WorkerBoard {
    pub fn new(workers: impl IntoIterator<Item = u32>) -> Self {
        let states = workers.into_iter().map(|w| (w, WorkerState::Idle)).collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    pub fn set(&self, worker: u32, state: WorkerState) {
        let mut states = self.states.write();
        let entry = states.entry(worker).or_insert(WorkerState::Idle);
        if !entry.is_terminal() {
            *entry = state;
        }
    }

    pub fn get(&self, worker: u32) -> Option<WorkerState> {
        self.states.read().get(&worker).cloned()
    }

    /// Count of workers per state label, for progress logging.
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for state in self.states.read().values() {
            *counts.entry(state.label()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_sticky() {
        let board = WorkerBoard::new(1..=2);
        board.set(1, WorkerState::Running);
        board.set(1, WorkerState::Finished(FinishReason::ScriptDone));
        board.set(1, WorkerState::Running);

        assert_eq!(board.get(1), Some(WorkerState::Finished(FinishReason::ScriptDone)));
        assert_eq!(board.summary().get("idle"), Some(&1));

        board.set(2, WorkerState::Failed(WeaverError::Cancelled));
        board.set(2, WorkerState::Running);
        assert_eq!(board.get(2), Some(WorkerState::Failed(WeaverError::Cancelled)));
        assert_eq!(board.summary().get("finished"), Some(&1));
    }
}
