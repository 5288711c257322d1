//! Transport abstraction for the SimWatch engine.

use crate::error::EnvError;
use crate::types::{ControlResponse, ScenarioDescriptor, StartResponse};
use async_trait::async_trait;
use serde_json::Value;

/// Control-plane requests against the simulation server.
///
/// # Implementations
///
/// - **Production**: `HttpTransport` (reqwest)
/// - **Simulation**: `SimBackend` in `simwatch_sim` (in-memory)
///
/// # Error policy
///
/// A request that reaches the server always yields `Ok`, whatever the status
/// code; callers branch on `ok`. `Err` is reserved for requests that never
/// completed (network failure, timeout). Implementations log failures and
/// never panic.
#[async_trait]
pub trait ControlTransport: Send + Sync + 'static {
    /// Starts a scenario with the given configuration.
    ///
    /// # Returns
    /// * `Ok(resp)` with `resp.stream_locator = Some(..)` - started, stream available
    /// * `Ok(resp)` with `resp.ok && resp.stream_locator.is_none()` - started without streaming
    /// * `Ok(resp)` with `!resp.ok` - server rejected the request
    /// * `Err(_)` - request never completed
    async fn start(&self, options: &Value) -> Result<StartResponse, EnvError>;

    /// Stops the run identified by `descriptor`.
    ///
    /// With no descriptor the request still goes out, addressed to
    /// the `NO_SCENARIO` sentinel.
    async fn stop(&self, descriptor: Option<&ScenarioDescriptor>) -> Result<ControlResponse, EnvError>;

    /// Emergency stop. Best effort; valid with no known active run.
    async fn panic(&self) -> Result<ControlResponse, EnvError>;

    /// Resolves a stream locator to a full stream URL on the control host.
    fn stream_url(&self, locator: &str) -> Result<String, EnvError>;
}

/// Opens stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    /// Connects to `url` and returns the frame stream.
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, EnvError>;
}

/// One open stream connection delivering text frames in transport order.
#[async_trait]
pub trait FrameStream: Send {
    /// Receives the next text frame.
    ///
    /// # Returns
    /// * `Some(Ok(frame))` - a frame arrived
    /// * `Some(Err(_))` - the connection broke
    /// * `None` - the connection was closed
    async fn next_frame(&mut self) -> Option<Result<String, EnvError>>;

    /// Closes the connection from our side.
    async fn close(&mut self) -> Result<(), EnvError>;
}
