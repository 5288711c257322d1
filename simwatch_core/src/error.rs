//! Error types for the synchronization engine.

use simwatch_env::{AgentId, EnvError};
use thiserror::Error;

/// Boxed error returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the engine.
///
/// Everything except `Transport` is scoped to a single
/// telemetry message: the stream keeps flowing after it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Frame was not valid JSON or a `batch` payload was incomplete
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Batch referenced an agent with no series in the store
    #[error("Unknown agent in telemetry: {0}")]
    UnknownAgent(AgentId),

    /// A registered message handler failed; later handlers were skipped
    #[error("Message handler #{index} failed: {source}")]
    Handler {
        index: usize,
        #[source]
        source: HandlerError,
    },

    /// Control request or stream connection failed
    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),
}

impl SyncError {
    /// True for errors that only abort handling of one message.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedFrame(_) | SyncError::UnknownAgent(_) | SyncError::Handler { .. }
        )
    }
}
