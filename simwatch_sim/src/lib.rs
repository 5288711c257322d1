//! SimWatch Simulation Harness
//!
//! Runs the real [`SyncEngine`](simwatch_core::SyncEngine) against an
//! in-memory scenario server so every fault path can be exercised without a
//! network:
//! - **Control**: start/stop/panic answered by [`SimBackend`]
//! - **Stream**: frames queued on per-run channels, closed on demand
//! - **Telemetry**: all values derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                       │
//! │                                                          │
//! │  TelemetryGenerator ──► SimBackend ◄── SyncEngine        │
//! │   (ChaCha8 seeded)       │  control      │               │
//! │                          │  stream  ─────┘               │
//! │                          ▼                               │
//! │                   per-run mpsc feed                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use simwatch_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::Restart).await;
//! assert!(result.passed);
//! ```

pub mod backend;
pub mod exporter;
pub mod generator;
pub mod runner;
pub mod scenarios;

pub use backend::{SimBackend, SIM_HOST};
pub use exporter::{SeriesExport, SeriesPoint, StoreFrame};
pub use generator::{wire_run_id, TelemetryGenerator};
pub use runner::{ScenarioResult, ScenarioRunner, SimEngine};
pub use scenarios::ScenarioId;
