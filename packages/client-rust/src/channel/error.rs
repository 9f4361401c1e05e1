//! Error taxonomy of the operation channel.

use opchannel_core::PayloadError;

/// Every way an operation or the connection underneath it can fail.
///
/// `Clone` because a single reason (e.g. [`ChannelError::ConnectionClosed`])
/// is delivered to every pending callback at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("handshake did not complete within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },
    #[error("channel is not connected")]
    NotConnected,
    #[error("missing required parameter: {field}")]
    MissingParameter { field: String },
    #[error("callback has no failure handler")]
    CallbackContractViolation,
    #[error("operation {response} for {key} is already in flight")]
    DuplicateCorrelation { response: String, key: String },
    #[error("server reported failure: {message}")]
    ServerReportedFailure { message: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ChannelError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::MissingParameter {
            field: field.to_string(),
        }
    }

    pub(crate) fn server(message: impl Into<String>) -> Self {
        Self::ServerReportedFailure {
            message: message.into(),
        }
    }

    /// Whether this error was raised before anything was written to the wire.
    #[must_use]
    pub fn is_pre_send(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. }
                | Self::CallbackContractViolation
                | Self::DuplicateCorrelation { .. }
                | Self::InvalidRequest(_)
                | Self::InvalidConfig(_)
                | Self::HandshakeTimeout { .. }
        )
    }
}

impl From<PayloadError> for ChannelError {
    fn from(e: PayloadError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            ChannelError::missing("resourcePath").to_string(),
            "missing required parameter: resourcePath"
        );
        assert_eq!(
            ChannelError::server("boom").to_string(),
            "server reported failure: boom"
        );
        assert_eq!(
            ChannelError::HandshakeTimeout { timeout_ms: 250 }.to_string(),
            "handshake did not complete within 250ms"
        );
    }

    #[test]
    fn pre_send_classification() {
        assert!(ChannelError::CallbackContractViolation.is_pre_send());
        assert!(ChannelError::missing("x").is_pre_send());
        assert!(!ChannelError::ConnectionClosed.is_pre_send());
        assert!(!ChannelError::server("boom").is_pre_send());
        assert!(!ChannelError::Transport("reset".into()).is_pre_send());
    }
}
