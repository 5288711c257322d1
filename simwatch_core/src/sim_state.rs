//! Simulation server state as reported to the dashboard.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a server state update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimStateUpdate {
    /// Whether the server is ready/running
    pub ready: bool,

    /// Scenarios the server offers (shape owned by the server)
    #[serde(default)]
    pub scenarios: Vec<Value>,
}

/// Whether the simulation server is running, and what it can run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimState {
    running: bool,
    scenarios: Vec<Value>,
}

impl Default for SimState {
    /// Optimistically running until the server says otherwise.
    fn default() -> Self {
        Self {
            running: true,
            scenarios: Vec::new(),
        }
    }
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn currently_running(&self) -> bool {
        self.running
    }

    pub fn scenarios(&self) -> &[Value] {
        &self.scenarios
    }

    pub fn update_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Replaces both fields; `running` takes the update's `ready`.
    pub fn update_sim_state(&mut self, update: SimStateUpdate) {
        self.running = update.ready;
        self.scenarios = update.scenarios;
    }
}
