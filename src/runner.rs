use serde::{Deserialize, Serialize};

/// Run state as published by the external runner.
///
/// The core only consumes this; the runner owns the state machine and its
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Ready,
    Spawning,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunState::Ready => "ready",
            RunState::Spawning => "spawning",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Read-only view of the external runner that drives the load test.
///
/// The reporting path reads the current state and active user count from it
/// when building an [`crate::stats::AggregateReport`]; worker count comes
/// from the node registry.
pub trait RunnerView: Send + Sync {
    fn state(&self) -> RunState;
    fn user_count(&self) -> u64;
}

/// Fixed-value runner view, useful for embedding and tests.
#[derive(Debug, Clone)]
pub struct StaticRunner {
    pub run_state: RunState,
    pub users: u64,
}

impl StaticRunner {
    pub fn new(run_state: RunState, users: u64) -> Self {
        Self { run_state, users }
    }
}

impl RunnerView for StaticRunner {
    fn state(&self) -> RunState {
        self.run_state
    }

    fn user_count(&self) -> u64 {
        self.users
    }
}
