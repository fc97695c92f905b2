use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;

/// Reserved liveness probe kind. Answered inline, never dispatched.
pub const PING: &str = "ping";
/// Reserved liveness reply kind. Only refreshes activity.
pub const PONG: &str = "pong";
/// Kind used for failures that have no better response kind.
pub const ERROR: &str = "error";

/// WebSocket close codes used across the relay.
pub mod close_code {
    /// Explicit, intentional shutdown. Never triggers a reconnect.
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    /// Authentication rejected at accept time.
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// One message on the wire.
///
/// Domain payload lives in `fields` and is flattened next to `kind`,
/// `correlationId` and `error`, so `{"kind":"get-entity","correlationId":"x","uuid":"a"}`
/// round-trips without loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: None,
            error: None,
            fields: Map::new(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PING)
    }

    /// Liveness reply stamped with the current unix time in milliseconds.
    pub fn pong() -> Self {
        Self::new(PONG).with_field("timestamp", chrono::Utc::now().timestamp_millis())
    }

    /// An error response that keeps the request's correlation id.
    pub fn error_response(
        kind: impl Into<String>,
        correlation_id: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            correlation_id,
            error: Some(error.into()),
            fields: Map::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn take_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn is_ping(&self) -> bool {
        self.kind == PING
    }

    pub fn is_pong(&self) -> bool {
        self.kind == PONG
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_str(text)?;
        if envelope.kind.is_empty() {
            return Err(ProtocolError::MissingKind);
        }
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
