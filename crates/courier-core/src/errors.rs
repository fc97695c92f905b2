use std::time::Duration;

/// Outcome of a correlated request that did not get a response.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("not connected")]
    NotConnected,
    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },
    #[error("request {correlation_id} failed: {reason}")]
    ConnectionLost {
        correlation_id: String,
        reason: String,
    },
    #[error("request {correlation_id} was cancelled")]
    Cancelled { correlation_id: String },
}

impl CorrelationError {
    /// The correlation id involved, when one was assigned.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::NotConnected => None,
            Self::Timeout { correlation_id, .. }
            | Self::ConnectionLost { correlation_id, .. }
            | Self::Cancelled { correlation_id } => Some(correlation_id),
        }
    }

    /// Whether the caller may reasonably try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Timeout { .. } | Self::ConnectionLost { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Inbound frame that could not be decoded into an envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message has an empty kind")]
    MissingKind,
}

impl ProtocolError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingKind => "missing_kind",
        }
    }
}
