use super::error::BrokerError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Terminal status: the remote task finished successfully.
pub const STATUS_COMPLETED: &str = "completed";
/// Terminal status: the remote task reported failure.
pub const STATUS_FAILED: &str = "failed";

/// The wire unit exchanged with agents: a JSON object with a task-kind
/// discriminator, an optional correlation id, and free-form payload fields
/// flattened at the top level.
///
/// The broker never interprets payload fields except `status`, which ends a
/// reply stream when it carries one of the terminal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Task-kind discriminator (`"SYNC_CODE"`, `"GENERATE"`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Present on request/stream dispatches; replies echo it verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Task-specific fields, opaque to the broker.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Uncorrelated envelope, as used by fire-and-forget dispatch.
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: None,
            payload,
        }
    }

    /// Correlated envelope for request/stream exchanges and their replies.
    pub fn correlated(
        kind: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: Some(correlation_id.into()),
            payload,
        }
    }

    /// Decode one text frame.
    pub fn decode(frame: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(frame).map_err(|e| BrokerError::Decode {
            message: e.to_string(),
        })
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, BrokerError> {
        serde_json::to_string(self).map_err(|e| BrokerError::Transport {
            message: format!("failed to encode envelope: {e}"),
        })
    }

    /// The `status` payload field, when present and textual.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// True when this envelope ends a reply stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), Some(STATUS_COMPLETED | STATUS_FAILED))
    }

    /// True when the remote task reported failure.
    pub fn is_failed(&self) -> bool {
        self.status() == Some(STATUS_FAILED)
    }
}
