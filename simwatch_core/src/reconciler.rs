//! Run Reconciler - the authoritative record of the active scenario.
//!
//! ```text
//!            scenario started
//!   ┌──────┐ ─────────────────► ┌──────────────────────┐
//!   │ Idle │                    │ Active(descriptor)   │
//!   └──────┘ ◄───────────────── └──────────────────────┘
//!            stop / panic / close (if configured)
//! ```
//!
//! Telemetry is accepted only while Active, and only when the event's run id
//! renders to the same string as the descriptor's id.

use simwatch_env::{RunId, ScenarioDescriptor};
use tracing::{info, warn};

/// Reconciler state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Active(ScenarioDescriptor),
}

/// Tracks which scenario is active and filters telemetry against it.
#[derive(Debug, Default)]
pub struct RunReconciler {
    state: RunState,
}

impl RunReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `descriptor` the active run, returning the run it replaced.
    pub fn activate(&mut self, descriptor: ScenarioDescriptor) -> Option<ScenarioDescriptor> {
        info!(
            "run {} active ({} agents, scenario '{}')",
            descriptor.id,
            descriptor.agents.len(),
            descriptor.scenario_name
        );
        let previous = std::mem::replace(&mut self.state, RunState::Active(descriptor));
        match previous {
            RunState::Active(old) => {
                warn!("run {} replaced without a stop", old.id);
                Some(old)
            }
            RunState::Idle => None,
        }
    }

    /// Returns to Idle, handing back the run that was active.
    pub fn deactivate(&mut self) -> Option<ScenarioDescriptor> {
        match std::mem::take(&mut self.state) {
            RunState::Active(old) => {
                info!("run {} cleared", old.id);
                Some(old)
            }
            RunState::Idle => None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Returns the active descriptor, if any.
    pub fn active(&self) -> Option<&ScenarioDescriptor> {
        match &self.state {
            RunState::Active(descriptor) => Some(descriptor),
            RunState::Idle => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, RunState::Active(_))
    }

    /// True if `run_id` belongs to the active run.
    ///
    /// Ids are compared by string form so a numeric `42` from one path
    /// matches a string `"42"` from another. Rejections are logged with
    /// both raw values and their JSON types.
    pub fn accepts(&self, run_id: &RunId) -> bool {
        match &self.state {
            RunState::Active(descriptor) => {
                if run_id.matches(&descriptor.id) {
                    true
                } else {
                    warn!(
                        "dropping telemetry for run {} ({}), active run is {} ({})",
                        run_id.raw(),
                        run_id.type_name(),
                        descriptor.id.raw(),
                        descriptor.id.type_name()
                    );
                    false
                }
            }
            RunState::Idle => {
                warn!(
                    "dropping telemetry for run {} ({}), no active run",
                    run_id.raw(),
                    run_id.type_name()
                );
                false
            }
        }
    }
}
