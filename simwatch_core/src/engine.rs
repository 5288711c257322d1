//! Sync Engine - wires transport, channel, reconciler and store together.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          SyncEngine                          │
//! │                                                              │
//! │  start/stop/panic ──► ControlTransport (HTTP)                │
//! │        │                                                     │
//! │        ▼ locator                                             │
//! │  StreamingChannel ──► decode ──► handlers (in order)         │
//! │        │                                                     │
//! │        ▼ batch                                               │
//! │  RunReconciler.accepts? ──► SeriesStore.apply_batch          │
//! │                                   │                          │
//! │                                   ▼                          │
//! │                         version watch channel                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutating entry point takes `&mut self`: the engine is the single
//! writer. Share it across tasks behind one `tokio::sync::Mutex`; readers that
//! only need change notification use [`SyncEngine::subscribe`].
//!
//! # Usage
//!
//! ```ignore
//! use simwatch_core::{SyncConfig, SyncEngine};
//! use simwatch_env::{HttpTransport, WsConnector};
//!
//! let transport = Arc::new(HttpTransport::new("http://localhost:4000")?);
//! let mut engine = SyncEngine::new(SyncConfig::default(), transport, Arc::new(WsConnector::new()));
//!
//! engine.start(&options).await?;
//! let summary = engine.run_stream().await;
//! ```

use crate::channel::{MessageHandler, StreamingChannel};
use crate::config::{CloseBehavior, SyncConfig};
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::reconciler::RunReconciler;
use crate::series::SeriesStore;
use crate::sim_state::{SimState, SimStateUpdate};
use crate::telemetry::{BatchEvent, TelemetryMessage};

use rand::Rng;
use serde_json::Value;
use simwatch_env::{ControlResponse, ControlTransport, RunId, ScenarioDescriptor, StreamConnector};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How a start request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// Run started and its stream is open
    Streaming { run: Option<RunId>, url: String },

    /// Server accepted the start but sent no stream locator
    StartedWithoutStream { run: Option<RunId> },

    /// Server answered with a non-success status
    Rejected { status: u16, body: Value },
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Batch applied; store now at `version`
    Applied { version: u64 },

    /// Batch belonged to another (or no) run and was dropped
    Stale,

    /// Not a batch; handlers saw it, the store did not
    PassedThrough,
}

/// Totals for one [`SyncEngine::run_stream`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames: u64,
    pub applied: u64,
    pub dropped: u64,
    /// The closure sent an active run back to Idle
    pub returned_to_idle: bool,
}

/// One step of the stream plane.
enum StreamEvent {
    Frame(Result<FrameOutcome, SyncError>),
    Closed { returned_to_idle: bool },
    NoStream,
}

/// The telemetry synchronization engine.
///
/// Generic over the control transport and stream connector so the same
/// engine runs against a live server or the in-memory simulator.
pub struct SyncEngine<T, C>
where
    T: ControlTransport,
    C: StreamConnector,
{
    config: SyncConfig,
    transport: Arc<T>,
    connector: Arc<C>,
    reconciler: RunReconciler,
    store: SeriesStore,
    channel: StreamingChannel,
    sim_state: SimState,
    metrics: SyncMetrics,
    version_tx: watch::Sender<u64>,
}

impl<T, C> SyncEngine<T, C>
where
    T: ControlTransport,
    C: StreamConnector,
{
    /// Creates an Idle engine with an empty store.
    pub fn new(config: SyncConfig, transport: Arc<T>, connector: Arc<C>) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            config,
            transport,
            connector,
            reconciler: RunReconciler::new(),
            store: SeriesStore::new(),
            channel: StreamingChannel::new(),
            sim_state: SimState::new(),
            metrics: SyncMetrics::default(),
            version_tx,
        }
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Starts a scenario and, if the server offers one, opens its stream.
    ///
    /// On success the reconciler becomes Active with the response's
    /// descriptor and the store is re-initialized before the stream opens.
    /// If the stream fails to open the run stays Active and the error is
    /// returned; call [`stop`](Self::stop) or retry.
    pub async fn start(&mut self, options: &Value) -> Result<StartOutcome, SyncError> {
        let response = match self.transport.start(options).await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.transport_failures += 1;
                return Err(e.into());
            }
        };

        if !response.ok {
            return Ok(StartOutcome::Rejected {
                status: response.status,
                body: response.body,
            });
        }

        // Whatever was streaming belongs to the previous run
        self.channel.close().await;

        let run = match response.descriptor {
            Some(descriptor) => {
                let id = descriptor.id.clone();
                self.scenario_started(descriptor);
                Some(id)
            }
            None => {
                // The server started something we cannot track; drop the old run
                warn!("start response carried no scenario descriptor, going idle");
                self.clear_run();
                None
            }
        };

        let Some(locator) = response.stream_locator else {
            info!("scenario started without streaming");
            return Ok(StartOutcome::StartedWithoutStream { run });
        };

        let url = self.transport.stream_url(&locator)?;
        if let Err(e) = self.channel.open(self.connector.as_ref(), &url).await {
            error!("could not open stream {}: {}", url, e);
            self.metrics.transport_failures += 1;
            return Err(e.into());
        }
        self.metrics.channels_opened += 1;

        Ok(StartOutcome::Streaming { run, url })
    }

    /// Stops the active run.
    ///
    /// Local state is cleared only once the server acknowledges the stop.
    pub async fn stop(&mut self) -> Result<ControlResponse, SyncError> {
        let result = self.transport.stop(self.reconciler.active()).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics.transport_failures += 1;
                return Err(e.into());
            }
        };

        if response.ok {
            self.channel.close().await;
            let id = self.reconciler.active().map(|d| d.id.clone());
            self.scenario_stopped(id.as_ref());
        } else {
            warn!("stop not acknowledged (status {}), run kept", response.status);
        }
        Ok(response)
    }

    /// Emergency stop. Valid in any state.
    ///
    /// A successful response clears local state like an acknowledged stop.
    pub async fn panic(&mut self) -> Result<ControlResponse, SyncError> {
        let response = match self.transport.panic().await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.transport_failures += 1;
                return Err(e.into());
            }
        };

        if response.ok {
            self.channel.close().await;
            self.clear_run();
        } else {
            warn!("panic not acknowledged (status {})", response.status);
        }
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Stream plane
    // ------------------------------------------------------------------

    /// Handles one raw frame: decode, fan out to handlers, then reconcile
    /// and apply if it is a batch.
    ///
    /// Errors only concern this frame.
    pub fn handle_frame(&mut self, frame: &str) -> Result<FrameOutcome, SyncError> {
        self.metrics.frames_received += 1;

        let message = match self.channel.on_message(frame) {
            Ok(message) => message,
            Err(e) => {
                match &e {
                    SyncError::MalformedFrame(_) => self.metrics.malformed_frames += 1,
                    SyncError::Handler { .. } => self.metrics.handler_failures += 1,
                    _ => {}
                }
                warn!("frame dropped: {}", e);
                return Err(e);
            }
        };

        match message {
            TelemetryMessage::Batch(event) => self.actuator_sent(&event),
            TelemetryMessage::Unrecognized { kind, .. } => {
                self.metrics.unrecognized += 1;
                debug!("passing through message type {:?}", kind);
                Ok(FrameOutcome::PassedThrough)
            }
        }
    }

    /// Waits for and handles the next frame.
    ///
    /// Returns `None` once the stream is closed (after applying the
    /// configured [`CloseBehavior`]) or if no stream is open.
    pub async fn pump(&mut self) -> Option<Result<FrameOutcome, SyncError>> {
        match self.next_event().await {
            StreamEvent::Frame(result) => Some(result),
            StreamEvent::Closed { .. } | StreamEvent::NoStream => None,
        }
    }

    async fn next_event(&mut self) -> StreamEvent {
        if !self.channel.is_open() {
            return StreamEvent::NoStream;
        }
        match self.channel.next_frame().await {
            Some(frame) => StreamEvent::Frame(self.handle_frame(&frame)),
            None => StreamEvent::Closed {
                returned_to_idle: self.on_channel_closed(),
            },
        }
    }

    /// Handles frames until the stream closes.
    pub async fn run_stream(&mut self) -> StreamSummary {
        let before = self.metrics.clone();
        let mut summary = StreamSummary::default();

        loop {
            match self.next_event().await {
                StreamEvent::Frame(Ok(_)) => {}
                StreamEvent::Frame(Err(e)) if e.is_per_message() => {
                    debug!("continuing after per-message error: {}", e)
                }
                StreamEvent::Frame(Err(e)) => warn!("continuing after error: {}", e),
                StreamEvent::Closed { returned_to_idle } => {
                    summary.returned_to_idle = returned_to_idle;
                    break;
                }
                StreamEvent::NoStream => break,
            }
        }

        summary.frames = self.metrics.frames_received - before.frames_received;
        summary.applied = self.metrics.batches_applied - before.batches_applied;
        summary.dropped = self.metrics.dropped() - before.dropped();
        summary
    }

    /// Applies the close behavior. Returns true if an active run was cleared.
    fn on_channel_closed(&mut self) -> bool {
        if !self.reconciler.is_active() {
            return false;
        }
        match self.config.close_behavior {
            CloseBehavior::KeepRun => {
                info!("stream closed, run stays active");
                false
            }
            CloseBehavior::ReturnToIdle => {
                info!("stream closed, returning to idle");
                self.clear_run();
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Store entry points
    // ------------------------------------------------------------------

    /// Activates `descriptor` and rebuilds the store for it.
    pub fn scenario_started(&mut self, descriptor: ScenarioDescriptor) {
        self.store.initialize(&descriptor);
        self.reconciler.activate(descriptor);
        self.publish_version();
    }

    /// Clears the run if `id` is the active one (or `None`).
    ///
    /// Returns whether anything was cleared.
    pub fn scenario_stopped(&mut self, id: Option<&RunId>) -> bool {
        let Some(active) = self.reconciler.active() else {
            debug!("stop for {:?} with no active run", id.map(RunId::as_key));
            return false;
        };
        if let Some(id) = id {
            if !id.matches(&active.id) {
                warn!("ignoring stop for run {}, active run is {}", id, active.id);
                return false;
            }
        }
        self.clear_run();
        true
    }

    /// Reconciles one batch against the active run and applies it.
    pub fn actuator_sent(&mut self, event: &BatchEvent) -> Result<FrameOutcome, SyncError> {
        if !self.reconciler.accepts(&event.run_id) {
            self.metrics.stale_dropped += 1;
            return Ok(FrameOutcome::Stale);
        }

        match self.store.apply_batch(event) {
            Ok(version) => {
                self.metrics.batches_applied += 1;
                self.publish_version();
                Ok(FrameOutcome::Applied { version })
            }
            Err(e) => {
                self.metrics.unknown_agent += 1;
                warn!("batch for run {} rejected: {}", event.run_id, e);
                Err(e)
            }
        }
    }

    pub fn update_running(&mut self, running: bool) {
        self.sim_state.update_running(running);
    }

    pub fn update_sim_state(&mut self, update: SimStateUpdate) {
        self.sim_state.update_sim_state(update);
    }

    /// Fills every series with synthetic points (see
    /// [`SeriesStore::add_sample_agent_data`]).
    pub fn add_sample_agent_data<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.store.add_sample_agent_data(self.config.sample_points, rng);
        self.publish_version();
    }

    /// Appends a telemetry handler.
    pub fn register_handler(&mut self, handler: impl MessageHandler + 'static) {
        self.channel.register(handler);
    }

    fn clear_run(&mut self) {
        self.reconciler.deactivate();
        self.store.clear();
        self.publish_version();
    }

    fn publish_version(&self) {
        self.version_tx.send_replace(self.store.version());
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    /// Receiver notified on every store version change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub fn reconciler(&self) -> &RunReconciler {
        &self.reconciler
    }

    pub fn active(&self) -> Option<&ScenarioDescriptor> {
        self.reconciler.active()
    }

    pub fn sim_state(&self) -> &SimState {
        &self.sim_state
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_streaming(&self) -> bool {
        self.channel.is_open()
    }

    pub fn stream_url(&self) -> Option<&str> {
        self.channel.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use simwatch_env::routes;
    use simwatch_env::{AgentId, EnvError, FrameStream, StartResponse};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Control transport answering from a script and recording every call.
    struct MockTransport {
        locator: Option<String>,
        start_body: Value,
        /// Bodies answered before falling back to `start_body`
        queued_bodies: Mutex<VecDeque<Value>>,
        start_status: u16,
        fail: bool,
        calls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new(start_body: Value, locator: Option<&str>) -> Self {
            Self {
                locator: locator.map(str::to_owned),
                start_body,
                queued_bodies: Mutex::new(VecDeque::new()),
                start_status: 200,
                fail: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn then_answer(self, body: Value) -> Self {
            self.queued_bodies.lock().unwrap().push_back(body);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ControlTransport for MockTransport {
        async fn start(&self, _options: &Value) -> Result<StartResponse, EnvError> {
            self.calls.lock().unwrap().push(format!("POST {}", routes::START_PATH));
            if self.fail {
                return Err(EnvError::network("connection refused"));
            }
            let ok = (200..300).contains(&self.start_status);
            let body = match self.queued_bodies.lock().unwrap().pop_front() {
                Some(body) => body,
                None => self.start_body.clone(),
            };
            Ok(StartResponse {
                status: self.start_status,
                ok,
                stream_locator: self.locator.clone(),
                descriptor: ScenarioDescriptor::from_body(&body),
                body,
            })
        }

        async fn stop(&self, descriptor: Option<&ScenarioDescriptor>) -> Result<ControlResponse, EnvError> {
            let path = routes::stop_path(descriptor.map(|d| &d.id));
            self.calls.lock().unwrap().push(format!("PATCH {}", path));
            Ok(ControlResponse { status: 200, ok: true, body: Value::Null })
        }

        async fn panic(&self) -> Result<ControlResponse, EnvError> {
            self.calls.lock().unwrap().push(format!("PUT {}", routes::PANIC_PATH));
            if self.fail {
                return Err(EnvError::network("connection refused"));
            }
            Ok(ControlResponse { status: 200, ok: true, body: Value::Null })
        }

        fn stream_url(&self, locator: &str) -> Result<String, EnvError> {
            Ok(format!("ws://sim.test{}", locator))
        }
    }

    struct ScriptedStream {
        frames: VecDeque<String>,
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Option<Result<String, EnvError>> {
            self.frames.pop_front().map(Ok)
        }

        async fn close(&mut self) -> Result<(), EnvError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        frames: Vec<String>,
        refuse: bool,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamConnector for MockConnector {
        async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, EnvError> {
            self.urls.lock().unwrap().push(url.to_string());
            if self.refuse {
                return Err(EnvError::stream("handshake refused"));
            }
            Ok(Box::new(ScriptedStream {
                frames: self.frames.iter().cloned().collect(),
            }))
        }
    }

    fn batch_frame(run_id: Value, agent: &str, t: f64, act: f64, sen: f64) -> String {
        json!({
            "type": "batch",
            "data": {
                "run_id": run_id,
                "raw_id": agent,
                "elapsed_time": t,
                "actuators_issued": act,
                "sensor_data_received": sen,
            }
        })
        .to_string()
    }

    fn engine_with(
        transport: MockTransport,
        frames: Vec<String>,
        config: SyncConfig,
    ) -> (SyncEngine<MockTransport, MockConnector>, Arc<MockTransport>, Arc<MockConnector>) {
        let transport = Arc::new(transport);
        let connector = Arc::new(MockConnector {
            frames,
            ..Default::default()
        });
        let engine = SyncEngine::new(config, Arc::clone(&transport), Arc::clone(&connector));
        (engine, transport, connector)
    }

    fn scenario_42() -> Value {
        json!({"id": "42", "scenario_name": "grid", "agents": [{"id": "a1"}]})
    }

    #[tokio::test]
    async fn test_start_opens_exactly_one_stream() {
        let (mut engine, _transport, connector) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            vec![],
            SyncConfig::default(),
        );

        let outcome = engine.start(&json!({})).await.unwrap();

        assert_eq!(
            outcome,
            StartOutcome::Streaming {
                run: Some(RunId::from("42")),
                url: "ws://sim.test/ws/scenario/42".to_string()
            }
        );
        assert_eq!(*connector.urls.lock().unwrap(), vec!["ws://sim.test/ws/scenario/42"]);
        assert_eq!(engine.metrics().channels_opened, 1);

        let a1 = engine.store().get("a1").unwrap();
        assert_eq!(a1.x(), &[0.0]);
        assert_eq!(engine.store().get("a1_s").unwrap().y(), &[0.0]);
        assert_eq!(engine.store().version(), 0);
    }

    #[tokio::test]
    async fn test_coerced_batch_then_stale_then_stop() {
        let frames = vec![
            batch_frame(json!(42), "a1", 5.0, 3.0, 7.0),
            batch_frame(json!("99"), "a1", 6.0, 1.0, 1.0),
        ];
        let (mut engine, transport, _connector) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            frames,
            SyncConfig::default(),
        );
        engine.start(&json!({})).await.unwrap();

        assert_eq!(engine.pump().await.unwrap().unwrap(), FrameOutcome::Applied { version: 1 });
        let a1 = engine.store().get("a1").unwrap();
        assert_eq!(a1.x(), &[0.0, 5.0]);
        assert_eq!(a1.y(), &[0.0, 3.0]);
        let a1_s = engine.store().get("a1_s").unwrap();
        assert_eq!(a1_s.x(), &[0.0, 5.0]);
        assert_eq!(a1_s.y(), &[0.0, 7.0]);

        assert_eq!(engine.pump().await.unwrap().unwrap(), FrameOutcome::Stale);
        assert_eq!(engine.store().version(), 1);
        assert_eq!(engine.store().get("a1").unwrap().len(), 2);
        assert_eq!(engine.metrics().stale_dropped, 1);

        engine.stop().await.unwrap();

        assert!(transport.calls().contains(&"PATCH /api/scenario/42/stop".to_string()));
        assert!(engine.active().is_none());
        assert!(engine.store().is_empty());
        assert!(!engine.is_streaming());

        let late = BatchEvent {
            run_id: RunId(json!(42)),
            raw_id: AgentId::new("a1"),
            elapsed_time: 7.0,
            actuators_issued: 1.0,
            sensor_data_received: 1.0,
        };
        assert_eq!(engine.actuator_sent(&late).unwrap(), FrameOutcome::Stale);
        assert_eq!(engine.store().version(), 0);
    }

    #[tokio::test]
    async fn test_per_message_errors_do_not_stop_stream() {
        let frames = vec![
            "{garbage".to_string(),
            batch_frame(json!(42), "ghost", 1.0, 1.0, 1.0),
            json!({"type": "status", "ready": true}).to_string(),
            batch_frame(json!(42), "a1", 2.0, 4.0, 8.0),
        ];
        let (mut engine, _transport, _connector) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            frames,
            SyncConfig::default(),
        );
        engine.start(&json!({})).await.unwrap();

        let summary = engine.run_stream().await;

        assert_eq!(summary.frames, 4);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.dropped, 2);
        assert_eq!(engine.metrics().malformed_frames, 1);
        assert_eq!(engine.metrics().unknown_agent, 1);
        assert_eq!(engine.metrics().unrecognized, 1);
        assert_eq!(engine.store().get("a1").unwrap().len(), 2);
        // Default close behavior keeps the run
        assert!(engine.active().is_some());
        assert!(!summary.returned_to_idle);
    }

    #[tokio::test]
    async fn test_close_can_return_to_idle() {
        let (mut engine, _transport, _connector) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            vec![batch_frame(json!("42"), "a1", 1.0, 1.0, 1.0)],
            SyncConfig::default().with_close_behavior(CloseBehavior::ReturnToIdle),
        );
        engine.start(&json!({})).await.unwrap();

        let summary = engine.run_stream().await;

        assert_eq!(summary.applied, 1);
        assert!(summary.returned_to_idle);
        assert!(engine.active().is_none());
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_descriptor_drops_previous_run() {
        let transport = MockTransport::new(json!({"status": "started"}), None)
            .then_answer(json!({"id": "1", "agents": [{"id": "a1"}]}));
        let (mut engine, _transport, _connector) =
            engine_with(transport, vec![], SyncConfig::default());
        let versions = engine.subscribe();

        engine.start(&json!({})).await.unwrap();
        assert_eq!(engine.active().map(|d| d.id.as_key()), Some("1".to_string()));
        assert_eq!(engine.store().len(), 2);

        let outcome = engine.start(&json!({})).await.unwrap();

        assert_eq!(outcome, StartOutcome::StartedWithoutStream { run: None });
        assert!(engine.active().is_none());
        assert!(engine.store().is_empty());
        assert_eq!(*versions.borrow(), 0);
    }

    #[tokio::test]
    async fn test_stream_connect_failure_keeps_run_active() {
        let transport = Arc::new(MockTransport::new(scenario_42(), Some("/ws/scenario/42")));
        let connector = Arc::new(MockConnector {
            refuse: true,
            ..Default::default()
        });
        let mut engine = SyncEngine::new(SyncConfig::default(), transport, Arc::clone(&connector));

        let err = engine.start(&json!({})).await.unwrap_err();

        assert!(matches!(err, SyncError::Transport(EnvError::StreamError(_))));
        assert_eq!(engine.metrics().transport_failures, 1);
        assert_eq!(engine.metrics().channels_opened, 0);
        assert_eq!(*connector.urls.lock().unwrap(), vec!["ws://sim.test/ws/scenario/42"]);
        assert!(!engine.is_streaming());
        // The server did start the run
        assert_eq!(engine.active().map(|d| d.id.as_key()), Some("42".to_string()));
        assert_eq!(engine.store().len(), 2);
    }

    #[tokio::test]
    async fn test_returned_to_idle_only_when_closure_clears_a_run() {
        let config = SyncConfig::default().with_close_behavior(CloseBehavior::ReturnToIdle);

        // Idle with no stream: nothing closes, nothing returns to idle
        let (mut engine, _t, _c) = engine_with(
            MockTransport::new(scenario_42(), None),
            vec![],
            config.clone(),
        );
        let summary = engine.run_stream().await;
        assert!(!summary.returned_to_idle);
        assert_eq!(summary.frames, 0);

        // Stream open but the run is gone before it closes
        let (mut engine, _t, _c) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            vec![batch_frame(json!(42), "a1", 1.0, 1.0, 1.0)],
            config,
        );
        engine.start(&json!({})).await.unwrap();
        assert!(engine.scenario_stopped(None));
        let summary = engine.run_stream().await;
        assert_eq!(summary.frames, 1);
        assert!(!summary.returned_to_idle);
    }

    #[tokio::test]
    async fn test_start_without_locator() {
        let (mut engine, _transport, connector) = engine_with(
            MockTransport::new(scenario_42(), None),
            vec![],
            SyncConfig::default().with_close_behavior(CloseBehavior::ReturnToIdle),
        );

        let outcome = engine.start(&json!({})).await.unwrap();

        assert_eq!(outcome, StartOutcome::StartedWithoutStream { run: Some(RunId::from("42")) });
        assert!(connector.urls.lock().unwrap().is_empty());
        assert!(engine.active().is_some());
        // No stream was ever open, so there is no closure to react to
        assert!(engine.pump().await.is_none());
        assert!(engine.active().is_some());
    }

    #[tokio::test]
    async fn test_rejected_and_failed_start_leave_engine_idle() {
        let mut rejected = MockTransport::new(json!({"error": "busy"}), Some("/ws/x"));
        rejected.start_status = 409;
        let (mut engine, _t, connector) = engine_with(rejected, vec![], SyncConfig::default());

        let outcome = engine.start(&json!({})).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Rejected { status: 409, .. }));
        assert!(engine.active().is_none());
        assert!(connector.urls.lock().unwrap().is_empty());

        let mut failing = MockTransport::new(scenario_42(), Some("/ws/x"));
        failing.fail = true;
        let (mut engine, _t, _c) = engine_with(failing, vec![], SyncConfig::default());

        let err = engine.start(&json!({})).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(EnvError::NetworkError(_))));
        assert_eq!(engine.metrics().transport_failures, 1);
    }

    #[tokio::test]
    async fn test_stop_and_panic_while_idle() {
        let mut transport = MockTransport::new(scenario_42(), None);
        transport.fail = true;
        let (mut engine, transport, _c) = engine_with(transport, vec![], SyncConfig::default());

        engine.stop().await.unwrap();
        assert!(engine.panic().await.is_err());

        assert_eq!(
            transport.calls(),
            vec!["PATCH /api/scenario/NO_SCENARIO/stop", "PUT /api/scenario/panic"]
        );
    }

    #[tokio::test]
    async fn test_panic_clears_active_run() {
        let (mut engine, _transport, _connector) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            vec![],
            SyncConfig::default(),
        );
        engine.start(&json!({})).await.unwrap();

        engine.panic().await.unwrap();

        assert!(engine.active().is_none());
        assert!(engine.store().is_empty());
        assert!(!engine.is_streaming());
    }

    #[tokio::test]
    async fn test_version_watch_sees_applied_batches() {
        let (mut engine, _transport, _connector) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            vec![batch_frame(json!(42), "a1", 1.0, 1.0, 1.0)],
            SyncConfig::default(),
        );
        let mut rx = engine.subscribe();
        engine.start(&json!({})).await.unwrap();
        let _ = rx.borrow_and_update();

        engine.pump().await.unwrap().unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_handlers_see_stale_and_unrecognized_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (mut engine, _transport, _connector) = engine_with(
            MockTransport::new(scenario_42(), Some("/ws/scenario/42")),
            vec![
                batch_frame(json!("7"), "a1", 1.0, 1.0, 1.0),
                json!({"type": "hello"}).to_string(),
            ],
            SyncConfig::default(),
        );
        let sink = Arc::clone(&seen);
        engine.register_handler(move |m: &TelemetryMessage| -> Result<(), crate::HandlerError> {
            sink.lock().unwrap().push(m.kind().unwrap_or("").to_string());
            Ok(())
        });
        engine.start(&json!({})).await.unwrap();

        engine.run_stream().await;

        // The stale batch is still delivered to generic subscribers
        assert_eq!(*seen.lock().unwrap(), vec!["batch", "hello"]);
        assert_eq!(engine.store().version(), 0);
    }

    #[test]
    fn test_scenario_stopped_ignores_foreign_id() {
        let (mut engine, _t, _c) = engine_with(
            MockTransport::new(scenario_42(), None),
            vec![],
            SyncConfig::default(),
        );
        engine.scenario_started(ScenarioDescriptor::from_body(&scenario_42()).unwrap());

        assert!(!engine.scenario_stopped(Some(&RunId::from("99"))));
        assert!(engine.active().is_some());
        assert!(engine.scenario_stopped(Some(&RunId(json!(42)))));
        assert!(engine.active().is_none());
        assert!(!engine.scenario_stopped(None));
    }

    #[test]
    fn test_sim_state_entry_points() {
        let (mut engine, _t, _c) = engine_with(
            MockTransport::new(scenario_42(), None),
            vec![],
            SyncConfig::default(),
        );

        engine.update_running(false);
        assert!(!engine.sim_state().currently_running());

        engine.update_sim_state(SimStateUpdate {
            ready: true,
            scenarios: vec![json!("grid")],
        });
        assert!(engine.sim_state().currently_running());
        assert_eq!(engine.sim_state().scenarios().len(), 1);
    }
}
