//! Counters describing what happened to inbound telemetry.
//!
//! Dropped and rejected messages never reach the user; these counters (and
//! the matching log lines) are how an operator sees them.

use serde::Serialize;

/// Telemetry counters for the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetrics {
    /// Raw frames received from the stream
    pub frames_received: u64,

    /// Batches applied to the series store
    pub batches_applied: u64,

    /// Batches dropped because their run was not the active one
    pub stale_dropped: u64,

    /// Batches naming an agent the store does not know
    pub unknown_agent: u64,

    /// Frames that failed to decode
    pub malformed_frames: u64,

    /// Frames with a type the engine does not interpret
    pub unrecognized: u64,

    /// Messages aborted by a failing handler
    pub handler_failures: u64,

    /// Control requests that never completed
    pub transport_failures: u64,

    /// Stream connections opened
    pub channels_opened: u64,
}

impl SyncMetrics {
    /// Frames that did not end up in the store.
    pub fn dropped(&self) -> u64 {
        self.stale_dropped + self.unknown_agent + self.malformed_frames + self.handler_failures
    }
}
