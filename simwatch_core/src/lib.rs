//! SimWatch Core - Realtime Scenario Telemetry Synchronization
//!
//! Keeps a dashboard's view of a remote agent simulation consistent with the
//! run that is actually active:
//! 1. **Control**: start/stop/panic requests over HTTP
//! 2. **Streaming**: one telemetry connection per run, decoded into typed messages
//! 3. **Reconciliation**: telemetry from any run but the active one is dropped
//! 4. **Series**: append-only per-agent actuator/sensor series with a version counter

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod series;
pub mod sim_state;
pub mod telemetry;

// Re-export key types for convenience
pub use channel::{MessageHandler, StreamingChannel};
pub use config::{CloseBehavior, SyncConfig};
pub use engine::{FrameOutcome, StartOutcome, StreamSummary, SyncEngine};
pub use error::{HandlerError, SyncError};
pub use metrics::SyncMetrics;
pub use reconciler::{RunReconciler, RunState};
pub use series::{ChannelKind, Series, SeriesStore, SENSOR_SUFFIX};
pub use sim_state::{SimState, SimStateUpdate};
pub use telemetry::{BatchEvent, TelemetryMessage};
