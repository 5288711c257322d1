//! Deterministic telemetry source for simulated runs.
//!
//! The generator plays the part of the remote simulation: every agent keeps
//! its own clock and produces one batch per round with:
//! - Elapsed time advancing by a jittered tick
//! - A small random count of actuator commands issued
//! - Sensor data received tracking the actuator count with noise

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde_json::Value;
use simwatch_core::BatchEvent;
use simwatch_env::{AgentId, RunId, ScenarioDescriptor};
use std::collections::HashMap;

/// Seconds between batches for one agent.
pub const DEFAULT_TICK_SECS: f64 = 0.5;

/// Smallest step the jittered clock may take.
const MIN_STEP_SECS: f64 = 0.01;

#[derive(Debug, Clone, Copy, Default)]
struct AgentClock {
    elapsed: f64,
}

/// Produces batch telemetry for the agents of a run.
pub struct TelemetryGenerator {
    seed: u64,
    rng: ChaCha8Rng,
    clocks: HashMap<AgentId, AgentClock>,
    tick_secs: f64,
    jitter: Option<Normal<f64>>,
}

impl TelemetryGenerator {
    /// Creates a generator with the given seed.
    pub fn new(seed: u64) -> Self {
        Self::with_tick(seed, DEFAULT_TICK_SECS)
    }

    /// Creates a generator with a custom tick.
    pub fn with_tick(seed: u64, tick_secs: f64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            clocks: HashMap::new(),
            tick_secs,
            jitter: Normal::new(0.0, tick_secs * 0.1).ok(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Next batch for `agent` in `run`.
    pub fn next_batch(&mut self, run_id: &RunId, agent: &AgentId) -> BatchEvent {
        let noise = match &self.jitter {
            Some(jitter) => jitter.sample(&mut self.rng),
            None => 0.0,
        };
        let step = (self.tick_secs + noise).max(MIN_STEP_SECS);
        let clock = self.clocks.entry(agent.clone()).or_default();
        clock.elapsed += step;
        let elapsed_time = clock.elapsed;

        let actuators_issued = self.rng.gen_range(0..5) as f64;
        let sensor_data_received = actuators_issued + self.rng.gen_range(0..3) as f64;

        BatchEvent {
            run_id: run_id.clone(),
            raw_id: agent.clone(),
            elapsed_time,
            actuators_issued,
            sensor_data_received,
        }
    }

    /// One batch per agent of `descriptor`, tagged the way the server tags
    /// its telemetry (see [`wire_run_id`]).
    pub fn round(&mut self, descriptor: &ScenarioDescriptor) -> Vec<BatchEvent> {
        let run_id = wire_run_id(&descriptor.id);
        descriptor
            .agents
            .iter()
            .map(|agent| self.next_batch(&run_id, &agent.id))
            .collect()
    }

    /// Forgets every agent clock, as when a new run begins.
    pub fn reset_clocks(&mut self) {
        self.clocks.clear();
    }
}

/// The run id as it appears in streamed telemetry.
///
/// The control API hands ids out as strings; the stream sends numeric ids as
/// JSON numbers.
pub fn wire_run_id(id: &RunId) -> RunId {
    match id.as_key().parse::<u64>() {
        Ok(n) => RunId(Value::from(n)),
        Err(_) => id.clone(),
    }
}
