//! Telemetry wire messages.
//!
//! Frames are JSON objects tagged by `type`. Only `batch` is understood by the
//! engine; anything else is kept verbatim as [`TelemetryMessage::Unrecognized`]
//! so generic subscribers still see it.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use simwatch_env::{AgentId, RunId};

/// Wire tag of a batch frame.
pub const BATCH_TYPE: &str = "batch";

/// One agent's measurement at a point in elapsed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    /// Run the measurement belongs to (number or string on the wire)
    pub run_id: RunId,

    /// Agent the measurement pertains to
    pub raw_id: AgentId,

    /// Remote clock elapsed time (x-axis)
    pub elapsed_time: f64,

    /// Actuator y-value
    pub actuators_issued: f64,

    /// Sensor y-value
    pub sensor_data_received: f64,
}

impl BatchEvent {
    /// Encodes the event as a `{"type":"batch","data":...}` frame.
    pub fn to_frame(&self) -> String {
        json!({ "type": BATCH_TYPE, "data": self }).to_string()
    }
}

/// A decoded telemetry frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    Batch(BatchEvent),

    /// Any other frame, passed through untouched
    Unrecognized {
        /// The `type` tag, if the frame had a string one
        kind: Option<String>,
        /// The whole parsed frame
        raw: Value,
    },
}

impl TelemetryMessage {
    /// Parses a text frame.
    ///
    /// Invalid JSON, and `batch` frames whose `data` does not decode, are
    /// `MalformedFrame` errors.
    pub fn decode(frame: &str) -> Result<Self, SyncError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| SyncError::MalformedFrame(e.to_string()))?;

        match value.get("type").and_then(Value::as_str) {
            Some(BATCH_TYPE) => {
                let data = value
                    .get("data")
                    .cloned()
                    .ok_or_else(|| SyncError::MalformedFrame("batch frame without data".to_string()))?;
                serde_json::from_value(data)
                    .map(TelemetryMessage::Batch)
                    .map_err(|e| SyncError::MalformedFrame(format!("batch payload: {}", e)))
            }
            kind => Ok(TelemetryMessage::Unrecognized {
                kind: kind.map(str::to_owned),
                raw: value,
            }),
        }
    }

    /// Returns the wire tag.
    pub fn kind(&self) -> Option<&str> {
        match self {
            TelemetryMessage::Batch(_) => Some(BATCH_TYPE),
            TelemetryMessage::Unrecognized { kind, .. } => kind.as_deref(),
        }
    }

    pub fn as_batch(&self) -> Option<&BatchEvent> {
        match self {
            TelemetryMessage::Batch(event) => Some(event),
            TelemetryMessage::Unrecognized { .. } => None,
        }
    }
}
