//! Engine configuration.

use crate::series::DEFAULT_SAMPLE_POINTS;
use std::time::Duration;

/// What a stream closure means for the active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseBehavior {
    /// Log the closure; the run stays active until stop or panic
    #[default]
    KeepRun,

    /// Treat the closure like a stop: clear the run and the store
    ReturnToIdle,
}

impl std::str::FromStr for CloseBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep" | "keep_run" | "keeprun" => Ok(CloseBehavior::KeepRun),
            "idle" | "return_to_idle" | "returntoidle" => Ok(CloseBehavior::ReturnToIdle),
            _ => Err(format!("Unknown close behavior: {}", s)),
        }
    }
}

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Control API base URL; the stream uses the same host
    pub base_url: String,

    /// Per-request timeout for control calls
    pub request_timeout: Duration,

    /// Stream closure handling
    pub close_behavior: CloseBehavior,

    /// Points per series for synthetic sample data
    pub sample_points: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            request_timeout: Duration::from_secs(10),
            close_behavior: CloseBehavior::KeepRun,
            sample_points: DEFAULT_SAMPLE_POINTS,
        }
    }
}

impl SyncConfig {
    /// Sets the control API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the stream closure handling.
    pub fn with_close_behavior(mut self, behavior: CloseBehavior) -> Self {
        self.close_behavior = behavior;
        self
    }
}
