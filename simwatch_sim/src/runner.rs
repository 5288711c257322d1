//! Scenario runner driving a real [`SyncEngine`] against the simulated backend.

use crate::backend::{SimBackend, SIM_HOST};
use crate::generator::{wire_run_id, TelemetryGenerator};
use crate::scenarios::ScenarioId;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use simwatch_core::{
    CloseBehavior, FrameOutcome, StartOutcome, SyncConfig, SyncEngine, SyncError, SyncMetrics,
};
use simwatch_env::{AgentId, RunId, ScenarioDescriptor};
use std::sync::Arc;
use tracing::{debug, info};

/// Engine wired to the in-memory backend on both planes.
pub type SimEngine = SyncEngine<SimBackend, SimBackend>;

/// Result of running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Batches the backend sent for the run(s) that should land
    pub batches_sent: u64,

    /// Store version at the end
    pub final_version: u64,

    /// Series in the store at the end
    pub series_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Engine counters at the end
    pub metrics: SyncMetrics,
}

/// Runs scenarios with deterministic telemetry.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of agents per run
    num_agents: usize,

    /// Batches each agent sends per run
    batches_per_agent: usize,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_agents: usize) -> Self {
        Self {
            seed,
            num_agents,
            batches_per_agent: 20,
        }
    }

    /// Sets the batches each agent sends.
    pub fn with_batches(mut self, batches: usize) -> Self {
        self.batches_per_agent = batches;
        self
    }

    /// Start options sent to the backend.
    pub fn options(&self, scenario: ScenarioId) -> Value {
        json!({
            "scenario_name": scenario.name(),
            "agents": self.num_agents,
        })
    }

    /// Builds an engine against `backend`.
    pub fn engine(backend: &Arc<SimBackend>, close_behavior: CloseBehavior) -> SimEngine {
        let config = SyncConfig::default()
            .with_base_url(format!("http://{}", SIM_HOST))
            .with_close_behavior(close_behavior);
        SyncEngine::new(config, backend.clone(), backend.clone())
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let backend = SimBackend::shared(self.seed % 1000 + 1);
        let close_behavior = match scenario {
            ScenarioId::ChannelClose => CloseBehavior::ReturnToIdle,
            _ => CloseBehavior::KeepRun,
        };
        let mut engine = Self::engine(&backend, close_behavior);
        let mut gen = TelemetryGenerator::new(self.seed);

        let outcome = match scenario {
            ScenarioId::Nominal => self.run_nominal(&mut engine, &backend, &mut gen).await,
            ScenarioId::StaleRun => self.run_stale_run(&mut engine, &backend, &mut gen).await,
            ScenarioId::UnknownAgent => self.run_unknown_agent(&mut engine, &backend, &mut gen).await,
            ScenarioId::MalformedFrames => self.run_malformed(&mut engine, &backend, &mut gen).await,
            ScenarioId::Restart => self.run_restart(&mut engine, &backend, &mut gen).await,
            ScenarioId::PanicStop => self.run_panic_stop(&mut engine, &backend, &mut gen).await,
            ScenarioId::NoStream => self.run_no_stream(&mut engine, &backend).await,
            ScenarioId::ChannelClose => self.run_channel_close(&mut engine, &backend, &mut gen).await,
            ScenarioId::Unreachable => self.run_unreachable(&mut engine, &backend, &mut gen).await,
        };

        let (batches_sent, failure_reason) = match outcome {
            Ok(sent) => (sent, None),
            Err(reason) => (0, Some(reason)),
        };

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            batches_sent,
            final_version: engine.store().version(),
            series_count: engine.store().len(),
            failure_reason,
            metrics: engine.metrics().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Shared steps
    // ------------------------------------------------------------------

    /// Starts a run and requires an open stream.
    pub async fn start_streaming(
        &self,
        engine: &mut SimEngine,
        scenario: ScenarioId,
    ) -> Result<ScenarioDescriptor, String> {
        match engine.start(&self.options(scenario)).await {
            Ok(StartOutcome::Streaming { url, .. }) => debug!("streaming from {}", url),
            Ok(other) => return Err(format!("expected a stream, got {:?}", other)),
            Err(e) => return Err(format!("start failed: {}", e)),
        }
        engine
            .active()
            .cloned()
            .ok_or_else(|| "start left the engine idle".to_string())
    }

    /// Queues every round of telemetry for `descriptor`. Returns batches sent.
    pub fn emit_rounds(
        &self,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
        descriptor: &ScenarioDescriptor,
    ) -> u64 {
        let mut sent = 0;
        for _ in 0..self.batches_per_agent {
            for batch in gen.round(descriptor) {
                if backend.emit_batch(&batch) {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Handles exactly `frames` frames without waiting for closure.
    async fn pump_frames(engine: &mut SimEngine, frames: u64) -> Result<(), String> {
        for handled in 0..frames {
            if engine.pump().await.is_none() {
                return Err(format!("stream ended after {} of {} frames", handled, frames));
            }
        }
        Ok(())
    }

    fn expect_series_len(engine: &SimEngine, len: usize) -> Result<(), String> {
        match engine.store().series().iter().find(|s| s.len() != len) {
            Some(series) => Err(format!(
                "series {} has {} points, expected {}",
                series.id(),
                series.len(),
                len
            )),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------

    async fn run_nominal(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        let versions = engine.subscribe();
        let descriptor = self.start_streaming(engine, ScenarioId::Nominal).await?;

        let sent = self.emit_rounds(backend, gen, &descriptor);
        backend.close_stream();
        let summary = engine.run_stream().await;

        ensure(summary.applied == sent, || {
            format!("applied {} of {} batches", summary.applied, sent)
        })?;
        ensure(summary.dropped == 0, || format!("{} frames dropped", summary.dropped))?;
        ensure(engine.store().version() == sent, || {
            format!("version {} after {} batches", engine.store().version(), sent)
        })?;
        ensure(*versions.borrow() == sent, || "version watch lagged the store".to_string())?;
        ensure(engine.store().len() == 2 * self.num_agents, || {
            format!("{} series for {} agents", engine.store().len(), self.num_agents)
        })?;
        Self::expect_series_len(engine, self.batches_per_agent + 1)?;
        ensure(engine.active().is_some(), || "stream closure ended the run".to_string())?;

        let response = engine.stop().await.map_err(|e| format!("stop failed: {}", e))?;
        ensure(response.ok, || format!("stop answered {}", response.status))?;
        ensure(engine.active().is_none() && engine.store().is_empty(), || {
            "stop left run state behind".to_string()
        })?;

        Ok(sent)
    }

    async fn run_stale_run(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        let descriptor = self.start_streaming(engine, ScenarioId::StaleRun).await?;
        let foreign = RunId(json!(descriptor.id.as_key().parse::<u64>().unwrap_or(0) + 1000));

        let mut sent = 0;
        let mut foreign_sent = 0;
        for _ in 0..self.batches_per_agent {
            for batch in gen.round(&descriptor) {
                let mut stale = batch.clone();
                stale.run_id = foreign.clone();
                backend.emit_batch(&batch);
                backend.emit_batch(&stale);
                sent += 1;
                foreign_sent += 1;
            }
        }
        backend.close_stream();
        engine.run_stream().await;

        let metrics = engine.metrics();
        ensure(metrics.stale_dropped == foreign_sent, || {
            format!("dropped {} of {} foreign batches", metrics.stale_dropped, foreign_sent)
        })?;
        ensure(metrics.batches_applied == sent, || {
            format!("applied {} of {} batches", metrics.batches_applied, sent)
        })?;
        ensure(engine.store().version() == sent, || {
            "foreign batches moved the version".to_string()
        })?;

        Ok(sent)
    }

    async fn run_unknown_agent(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        let descriptor = self.start_streaming(engine, ScenarioId::UnknownAgent).await?;
        let wire_id = wire_run_id(&descriptor.id);
        let ghost = AgentId::new("agent_ghost");

        let mut sent = 0;
        for _ in 0..self.batches_per_agent {
            for batch in gen.round(&descriptor) {
                backend.emit_batch(&batch);
                sent += 1;
            }
            backend.emit_batch(&gen.next_batch(&wire_id, &ghost));
        }
        backend.close_stream();
        engine.run_stream().await;

        let metrics = engine.metrics();
        ensure(metrics.unknown_agent == self.batches_per_agent as u64, || {
            format!("{} unknown-agent rejections", metrics.unknown_agent)
        })?;
        ensure(metrics.batches_applied == sent, || {
            format!("applied {} of {} batches", metrics.batches_applied, sent)
        })?;
        ensure(engine.store().actuator(&ghost).is_none(), || {
            "unknown agent got a series".to_string()
        })?;
        Self::expect_series_len(engine, self.batches_per_agent + 1)?;

        Ok(sent)
    }

    async fn run_malformed(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        let descriptor = self.start_streaming(engine, ScenarioId::MalformedFrames).await?;

        let mut sent = 0;
        for round in 0..self.batches_per_agent {
            for batch in gen.round(&descriptor) {
                backend.emit_batch(&batch);
                sent += 1;
            }
            backend.emit(format!("{{\"type\":\"batch\",\"data\":{{\"run_id\":{}", round));
            backend.emit(json!({"type": "batch", "data": {"run_id": 1}}).to_string());
            backend.emit(json!({"type": "heartbeat", "data": {"round": round}}).to_string());
        }
        backend.close_stream();
        engine.run_stream().await;

        let metrics = engine.metrics();
        let rounds = self.batches_per_agent as u64;
        ensure(metrics.malformed_frames == 2 * rounds, || {
            format!("{} malformed frames counted", metrics.malformed_frames)
        })?;
        ensure(metrics.unrecognized == rounds, || {
            format!("{} unrecognized frames counted", metrics.unrecognized)
        })?;
        ensure(metrics.batches_applied == sent, || {
            format!("applied {} of {} batches", metrics.batches_applied, sent)
        })?;
        ensure(engine.store().version() == sent, || "garbage moved the version".to_string())?;

        Ok(sent)
    }

    async fn run_restart(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        let first = self.start_streaming(engine, ScenarioId::Restart).await?;
        let first_sent = self.emit_rounds(backend, gen, &first);
        Self::pump_frames(engine, first_sent).await?;
        let late = gen.round(&first);

        let response = engine.stop().await.map_err(|e| format!("stop failed: {}", e))?;
        ensure(response.ok && engine.active().is_none(), || {
            "stop did not clear the first run".to_string()
        })?;

        gen.reset_clocks();
        let second = self.start_streaming(engine, ScenarioId::Restart).await?;
        ensure(!second.id.matches(&first.id), || "restart reused the run id".to_string())?;

        for batch in &late {
            backend.emit_batch(batch);
        }
        let second_sent = self.emit_rounds(backend, gen, &second);
        backend.close_stream();
        engine.run_stream().await;

        let metrics = engine.metrics();
        ensure(metrics.stale_dropped == late.len() as u64, || {
            format!("dropped {} of {} late batches", metrics.stale_dropped, late.len())
        })?;
        ensure(engine.store().version() == second_sent, || {
            format!("version {} after {} batches", engine.store().version(), second_sent)
        })?;
        ensure(metrics.batches_applied == first_sent + second_sent, || {
            format!("applied {} batches in total", metrics.batches_applied)
        })?;
        Self::expect_series_len(engine, self.batches_per_agent + 1)?;

        Ok(first_sent + second_sent)
    }

    async fn run_panic_stop(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        let descriptor = self.start_streaming(engine, ScenarioId::PanicStop).await?;
        let sent = self.emit_rounds(backend, gen, &descriptor);
        Self::pump_frames(engine, sent).await?;
        let late = gen.round(&descriptor);

        let response = engine.panic().await.map_err(|e| format!("panic failed: {}", e))?;
        ensure(response.ok, || format!("panic answered {}", response.status))?;
        ensure(engine.active().is_none() && engine.store().is_empty(), || {
            "panic left run state behind".to_string()
        })?;
        ensure(!engine.is_streaming(), || "panic left the stream open".to_string())?;
        ensure(backend.active_run().is_none(), || "backend still running".to_string())?;

        for batch in &late {
            match engine.actuator_sent(batch) {
                Ok(FrameOutcome::Stale) => {}
                other => return Err(format!("late batch after panic: {:?}", other)),
            }
        }
        ensure(engine.metrics().stale_dropped == late.len() as u64, || {
            "late batches not counted as stale".to_string()
        })?;

        Ok(sent)
    }

    async fn run_no_stream(&self, engine: &mut SimEngine, backend: &SimBackend) -> Result<u64, String> {
        backend.set_streaming(false);

        match engine.start(&self.options(ScenarioId::NoStream)).await {
            Ok(StartOutcome::StartedWithoutStream { run: Some(_) }) => {}
            other => return Err(format!("expected a start without stream, got {:?}", other)),
        }
        ensure(backend.connects().is_empty(), || "engine connected anyway".to_string())?;
        ensure(engine.active().is_some() && !engine.is_streaming(), || {
            "run should be active without a stream".to_string()
        })?;
        ensure(engine.pump().await.is_none(), || "pump yielded without a stream".to_string())?;
        ensure(engine.active().is_some(), || "pump without a stream ended the run".to_string())?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        engine.add_sample_agent_data(&mut rng);
        ensure(engine.store().version() == 1, || {
            format!("sample data left version {}", engine.store().version())
        })?;
        Self::expect_series_len(engine, 1 + engine.config().sample_points)?;

        Ok(0)
    }

    async fn run_channel_close(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        let versions = engine.subscribe();
        let descriptor = self.start_streaming(engine, ScenarioId::ChannelClose).await?;
        let sent = self.emit_rounds(backend, gen, &descriptor);
        backend.close_stream();
        let summary = engine.run_stream().await;

        ensure(summary.applied == sent, || {
            format!("applied {} of {} batches", summary.applied, sent)
        })?;
        ensure(summary.returned_to_idle, || "closure did not return to idle".to_string())?;
        ensure(engine.active().is_none() && engine.store().is_empty(), || {
            "closure left run state behind".to_string()
        })?;
        ensure(*versions.borrow() == 0, || "version watch not reset".to_string())?;

        let response = engine.stop().await.map_err(|e| format!("stop failed: {}", e))?;
        ensure(!response.ok, || "stop with no run was acknowledged".to_string())?;
        ensure(
            backend.requests().last().map(String::as_str) == Some("PATCH /api/scenario/NO_SCENARIO/stop"),
            || "stop did not use the no-scenario sentinel".to_string(),
        )?;

        Ok(sent)
    }

    async fn run_unreachable(
        &self,
        engine: &mut SimEngine,
        backend: &SimBackend,
        gen: &mut TelemetryGenerator,
    ) -> Result<u64, String> {
        backend.set_reachable(false);

        match engine.start(&self.options(ScenarioId::Unreachable)).await {
            Err(SyncError::Transport(_)) => {}
            other => return Err(format!("expected a transport error, got {:?}", other)),
        }
        ensure(engine.active().is_none(), || "failed start activated a run".to_string())?;
        ensure(engine.panic().await.is_err(), || "panic succeeded while unreachable".to_string())?;
        ensure(engine.metrics().transport_failures == 2, || {
            format!("{} transport failures counted", engine.metrics().transport_failures)
        })?;

        backend.set_reachable(true);
        let descriptor = self.start_streaming(engine, ScenarioId::Unreachable).await?;
        let sent = self.emit_rounds(backend, gen, &descriptor);
        backend.close_stream();
        let summary = engine.run_stream().await;
        ensure(summary.applied == sent, || {
            format!("applied {} of {} batches after recovery", summary.applied, sent)
        })?;

        Ok(sent)
    }
}

fn ensure(condition: bool, reason: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason())
    }
}
