//! Worker state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a worker runner is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for a wake-up event or the next poll.
    Idle,
    /// Racing other workers for a pending flag.
    AttemptingClaim,
    /// Running the domain step for a claimed flag.
    Executing,
    /// Writing the outcome back to the coordinator.
    Reporting,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Idle, AttemptingClaim)
                // Lost the race, or the flag vanished
                | (AttemptingClaim, Idle)
                | (AttemptingClaim, Executing)
                | (Executing, Reporting)
                | (Reporting, Idle)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AttemptingClaim => "attempting_claim",
            Self::Executing => "executing",
            Self::Reporting => "reporting",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub timestamp: DateTime<Utc>,
    /// Flag being handled, if any.
    pub flag_id: Option<Uuid>,
}

/// Snapshot of a runner: current state, counters and recent history.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub agent_id: String,
    pub state: WorkerState,
    pub current_flag: Option<Uuid>,
    /// Flags completed successfully.
    pub completed: u64,
    /// Flags failed by this worker, including panics.
    pub failed: u64,
    /// Claims lost to another worker or to expiry.
    pub conflicts: u64,
    pub transitions: Vec<StateTransition>,
}

/// History kept per worker.
const MAX_TRANSITIONS: usize = 100;

impl WorkerStatus {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: WorkerState::Idle,
            current_flag: None,
            completed: 0,
            failed: 0,
            conflicts: 0,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: WorkerState,
        flag_id: Option<Uuid>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            flag_id,
        });

        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        self.current_flag = match new_state {
            WorkerState::Idle => None,
            _ => flag_id.or(self.current_flag),
        };

        Ok(())
    }
}
