//! SimWatch Transport Abstraction Layer
//!
//! This crate isolates every piece of I/O the telemetry engine performs so the
//! same engine code runs against a **live** simulation server (reqwest +
//! tokio-tungstenite) or an **in-memory** backend in tests.
//!
//! # Planes
//!
//! - **Control plane**: request/response calls that start, stop and
//!   emergency-stop a scenario ([`ControlTransport`]).
//! - **Stream plane**: one long-lived connection per active run delivering
//!   JSON text frames ([`StreamConnector`], [`FrameStream`]).
//!
//! ```text
//! Engine                      Control plane                 Server
//!   |-- start(options) ------------>|-- POST /api/scenario ----->|
//!   |<-- StartResponse{locator} ----|<-- 2xx + x-scenario-ws ----|
//!   |-- connect(ws://host/locator) ---------- Stream plane ----->|
//!   |<-- next_frame() <------------------- {"type":"batch"} -----|
//! ```
//!
//! # Example
//!
//! ```ignore
//! use simwatch_env::{ControlTransport, HttpTransport};
//!
//! let transport = HttpTransport::new("http://localhost:4000")?;
//! let response = transport.start(&serde_json::json!({"agents": 4})).await?;
//! if let Some(locator) = response.stream_locator.as_deref() {
//!     let url = transport.stream_url(locator)?;
//! }
//! ```

mod error;
mod http_impl;
pub mod routes;
mod transport;
mod types;
mod ws_impl;

pub use error::EnvError;
pub use http_impl::HttpTransport;
pub use transport::{ControlTransport, FrameStream, StreamConnector};
pub use types::{js_string, AgentId, AgentSpec, ControlResponse, RunId, ScenarioDescriptor, StartResponse};
pub use ws_impl::WsConnector;
