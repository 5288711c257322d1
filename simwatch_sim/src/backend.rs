//! In-memory simulation server implementing both transport planes.

use async_trait::async_trait;
use serde_json::{json, Value};
use simwatch_core::BatchEvent;
use simwatch_env::routes::{self, NO_SCENARIO};
use simwatch_env::{
    AgentSpec, ControlResponse, ControlTransport, EnvError, FrameStream, RunId, ScenarioDescriptor,
    StartResponse, StreamConnector,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Host the simulated server pretends to live on.
pub const SIM_HOST: &str = "sim.local:4000";

/// Agents per scenario when the start options do not say.
pub const DEFAULT_AGENTS: usize = 4;

/// Simulated scenario server.
///
/// Hands out run ids as **strings** in start responses while telemetry
/// produced by [`TelemetryGenerator`](crate::TelemetryGenerator) carries them
/// as **numbers**, the mismatch a live server exhibits.
pub struct SimBackend {
    state: Arc<Mutex<BackendState>>,
}

struct BackendState {
    next_run: u64,
    active: Option<ScenarioDescriptor>,
    /// Sender feeding the active run's stream
    feed: Option<mpsc::UnboundedSender<String>>,
    /// Streams created by start but not yet connected, by locator
    pending: HashMap<String, mpsc::UnboundedReceiver<String>>,
    streaming: bool,
    reachable: bool,
    requests: Vec<String>,
    connects: Vec<String>,
}

impl SimBackend {
    /// Creates a reachable backend that offers streams; run ids start at `first_run`.
    pub fn new(first_run: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                next_run: first_run,
                active: None,
                feed: None,
                pending: HashMap::new(),
                streaming: true,
                reachable: true,
                requests: Vec::new(),
                connects: Vec::new(),
            })),
        }
    }

    /// Creates an Arc-wrapped backend for sharing with an engine.
    pub fn shared(first_run: u64) -> Arc<Self> {
        Arc::new(Self::new(first_run))
    }

    /// Whether start responses carry a stream locator.
    pub fn set_streaming(&self, streaming: bool) {
        self.state.lock().unwrap().streaming = streaming;
    }

    /// Simulates the server being unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Queues a raw frame on the active stream. Returns false if none is open.
    pub fn emit(&self, frame: impl Into<String>) -> bool {
        let state = self.state.lock().unwrap();
        match &state.feed {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Queues a batch frame on the active stream.
    pub fn emit_batch(&self, event: &BatchEvent) -> bool {
        self.emit(event.to_frame())
    }

    /// Closes the active stream from the server side. Queued frames are
    /// still delivered.
    pub fn close_stream(&self) {
        self.state.lock().unwrap().feed = None;
    }

    /// The run the server believes is active.
    pub fn active_run(&self) -> Option<ScenarioDescriptor> {
        self.state.lock().unwrap().active.clone()
    }

    /// Control requests received, as `METHOD path`.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Stream URLs connected to.
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    fn check_reachable(state: &BackendState) -> Result<(), EnvError> {
        if state.reachable {
            Ok(())
        } else {
            Err(EnvError::network("simulated server unreachable"))
        }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ControlTransport for SimBackend {
    async fn start(&self, options: &Value) -> Result<StartResponse, EnvError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(format!("POST {}", routes::START_PATH));
        Self::check_reachable(&state)?;

        let agent_count = options
            .get("agents")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_AGENTS);
        let scenario_name = options
            .get("scenario_name")
            .and_then(Value::as_str)
            .unwrap_or("simulation")
            .to_string();

        let run = state.next_run;
        state.next_run += 1;

        let agents = (0..agent_count)
            .map(|i| AgentSpec::new(format!("agent_{}", i).as_str()))
            .collect();
        let descriptor = ScenarioDescriptor::new(scenario_name, run.to_string(), agents);
        let body = serde_json::to_value(&descriptor)?;

        let stream_locator = if state.streaming {
            let locator = format!("/ws/scenario/{}", run);
            let (tx, rx) = mpsc::unbounded_channel();
            state.feed = Some(tx);
            state.pending.insert(locator.clone(), rx);
            Some(locator)
        } else {
            state.feed = None;
            None
        };
        state.active = Some(descriptor.clone());
        debug!("sim backend started run {}", run);

        Ok(StartResponse {
            status: 200,
            ok: true,
            stream_locator,
            descriptor: Some(descriptor),
            body,
        })
    }

    async fn stop(&self, descriptor: Option<&ScenarioDescriptor>) -> Result<ControlResponse, EnvError> {
        let mut state = self.state.lock().unwrap();
        let path = routes::stop_path(descriptor.map(|d| &d.id));
        state.requests.push(format!("PATCH {}", path));
        Self::check_reachable(&state)?;

        let matches_active = match (&state.active, descriptor) {
            (Some(active), Some(requested)) => active.id.matches(&requested.id),
            _ => false,
        };
        if !matches_active {
            let id = descriptor.map(|d| d.id.as_key()).unwrap_or_else(|| NO_SCENARIO.to_string());
            return Ok(ControlResponse {
                status: 404,
                ok: false,
                body: json!({ "error": format!("no running scenario {}", id) }),
            });
        }

        let stopped = state.active.take().map(|d| d.id);
        state.feed = None;
        Ok(ControlResponse {
            status: 200,
            ok: true,
            body: json!({ "stopped": stopped.map(|id: RunId| id.as_key()) }),
        })
    }

    async fn panic(&self) -> Result<ControlResponse, EnvError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(format!("PUT {}", routes::PANIC_PATH));
        Self::check_reachable(&state)?;

        state.active = None;
        state.feed = None;
        state.pending.clear();
        Ok(ControlResponse {
            status: 200,
            ok: true,
            body: Value::Null,
        })
    }

    fn stream_url(&self, locator: &str) -> Result<String, EnvError> {
        Ok(format!("ws://{}{}", SIM_HOST, locator))
    }
}

#[async_trait]
impl StreamConnector for SimBackend {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, EnvError> {
        let mut state = self.state.lock().unwrap();
        state.connects.push(url.to_string());

        let locator = url
            .strip_prefix("ws://")
            .and_then(|rest| rest.strip_prefix(SIM_HOST))
            .ok_or_else(|| EnvError::stream(format!("unknown host in {}", url)))?;
        let rx = state
            .pending
            .remove(locator)
            .ok_or_else(|| EnvError::stream(format!("no stream at {}", locator)))?;

        Ok(Box::new(SimFrameStream { rx }))
    }
}

/// Stream end of a simulated run.
struct SimFrameStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for SimFrameStream {
    async fn next_frame(&mut self) -> Option<Result<String, EnvError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), EnvError> {
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_hands_out_string_ids_and_locators() {
        let backend = SimBackend::new(42);

        let resp = backend.start(&json!({"agents": 2})).await.unwrap();

        let descriptor = resp.descriptor.unwrap();
        assert_eq!(descriptor.id.type_name(), "string");
        assert_eq!(descriptor.id.as_key(), "42");
        assert_eq!(descriptor.agents.len(), 2);
        assert_eq!(resp.stream_locator.as_deref(), Some("/ws/scenario/42"));
        assert_eq!(
            backend.stream_url("/ws/scenario/42").unwrap(),
            "ws://sim.local:4000/ws/scenario/42"
        );
    }

    #[tokio::test]
    async fn test_stream_delivers_queued_frames_then_closes() {
        let backend = SimBackend::new(1);
        backend.start(&json!({})).await.unwrap();
        let mut stream = backend.connect("ws://sim.local:4000/ws/scenario/1").await.unwrap();

        assert!(backend.emit("one"));
        assert!(backend.emit("two"));
        backend.close_stream();
        assert!(!backend.emit("three"));

        assert_eq!(stream.next_frame().await.unwrap().unwrap(), "one");
        assert_eq!(stream.next_frame().await.unwrap().unwrap(), "two");
        assert!(stream.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let backend = SimBackend::new(1);
        backend.start(&json!({})).await.unwrap();
        let url = "ws://sim.local:4000/ws/scenario/1";

        assert!(backend.connect(url).await.is_ok());
        assert!(matches!(backend.connect(url).await, Err(EnvError::StreamError(_))));
    }

    #[tokio::test]
    async fn test_stop_requires_matching_run() {
        let backend = SimBackend::new(5);
        let descriptor = backend.start(&json!({})).await.unwrap().descriptor.unwrap();

        let missing = backend.stop(None).await.unwrap();
        assert_eq!(missing.status, 404);

        let stopped = backend.stop(Some(&descriptor)).await.unwrap();
        assert!(stopped.ok);
        assert!(backend.active_run().is_none());
        assert_eq!(
            backend.requests(),
            vec![
                "POST /api/scenario",
                "PATCH /api/scenario/NO_SCENARIO/stop",
                "PATCH /api/scenario/5/stop",
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_errors() {
        let backend = SimBackend::new(1);
        backend.set_reachable(false);

        assert!(matches!(backend.start(&json!({})).await, Err(EnvError::NetworkError(_))));
        assert!(backend.panic().await.is_err());
    }
}
