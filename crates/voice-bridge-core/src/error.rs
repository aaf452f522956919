//! Error types for the voice call bridge

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for the bridge.
///
/// One variant per failure class the runtime distinguishes; components map
/// transport-level failures into these before they cross a crate boundary.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed, oversize or invalid-id wire message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bad shared secret or denied authorization
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Too many upgrade attempts from one source
    #[error("Rate limited")]
    RateLimited,

    /// No live gateway connection is available
    #[error("Gateway not connected")]
    GatewayNotConnected,

    /// A deadline elapsed (ring, response generation, pong, send)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Outbound call reached a terminal non-answer status
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// STT/TTS/agent network failure
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Unexpected event or payload from an upstream service
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Cooperative cancellation; never shown to the user
    #[error("Cancelled")]
    Cancelled,

    /// Feature gated off by configuration
    #[error("Disabled: {0}")]
    Disabled(String),

    /// Invariant violation inside the bridge
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// True for errors that end only the affected turn, not the call.
    pub fn is_turn_local(&self) -> bool {
        matches!(
            self,
            BridgeError::Cancelled | BridgeError::Timeout(_) | BridgeError::UpstreamUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_local_classification() {
        assert!(BridgeError::Cancelled.is_turn_local());
        assert!(BridgeError::Timeout("response".into()).is_turn_local());
        assert!(!BridgeError::GatewayNotConnected.is_turn_local());
        assert!(!BridgeError::Internal("bug".into()).is_turn_local());
    }

    #[test]
    fn json_error_maps_to_protocol() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(BridgeError::from(err), BridgeError::Protocol(_)));
    }
}
