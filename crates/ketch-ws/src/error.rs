//! WebSocket client error types.

use ketch_core::CoreError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// The closed set of client error kinds.
///
/// Transport and codec failures are folded into these kinds at the
/// conversion boundary so callers never see library-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WsError {
    #[error("Connect timed out")]
    Timeout,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("WebSocket upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("Connection lost")]
    Disconnected,

    #[error("Connection closed")]
    Closed,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Rate limited")]
    RateLimited,

    #[error("Rate limiter queue full")]
    QueueFull,

    #[error("Duplicate request id: {0}")]
    DuplicateId(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type WsResult<T> = Result<T, WsError>;

impl From<CoreError> for WsError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidConfig(msg) => WsError::InvalidConfig(msg),
        }
    }
}

impl From<serde_json::Error> for WsError {
    fn from(e: serde_json::Error) -> Self {
        WsError::InvalidFrame(e.to_string())
    }
}

impl From<tungstenite::Error> for WsError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Io(io) => WsError::ConnectionRefused(io.to_string()),
            tungstenite::Error::Http(resp) => {
                WsError::UpgradeFailed(format!("HTTP {}", resp.status()))
            }
            tungstenite::Error::HttpFormat(e) => WsError::UpgradeFailed(e.to_string()),
            tungstenite::Error::Tls(e) => WsError::ConnectionRefused(e.to_string()),
            tungstenite::Error::Url(e) => WsError::InvalidConfig(e.to_string()),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                WsError::Disconnected
            }
            tungstenite::Error::Protocol(e) => WsError::InvalidFrame(e.to_string()),
            tungstenite::Error::Capacity(e) => WsError::InvalidFrame(e.to_string()),
            other => {
                tracing::debug!(error = %other, "Unmapped transport error treated as disconnect");
                WsError::Disconnected
            }
        }
    }
}

impl WsError {
    /// Stable kind tag for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            WsError::Timeout => "timeout",
            WsError::ConnectionRefused(_) => "connection_refused",
            WsError::UpgradeFailed(_) => "upgrade_failed",
            WsError::Disconnected => "disconnected",
            WsError::Closed => "closed",
            WsError::RequestTimeout => "request_timeout",
            WsError::RateLimited => "rate_limited",
            WsError::QueueFull => "queue_full",
            WsError::DuplicateId(_) => "duplicate_id",
            WsError::HeartbeatTimeout => "heartbeat_timeout",
            WsError::AuthFailed(_) => "auth_failed",
            WsError::InvalidFrame(_) => "invalid_frame",
            WsError::InvalidConfig(_) => "invalid_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_folds_into_invalid_config() {
        let e: WsError = CoreError::InvalidConfig("url is required".to_string()).into();
        assert_eq!(e, WsError::InvalidConfig("url is required".to_string()));
    }

    #[test]
    fn test_json_error_folds_into_invalid_frame() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let e: WsError = parse_err.into();
        assert!(matches!(e, WsError::InvalidFrame(_)));
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(WsError::Disconnected.kind(), "disconnected");
        assert_eq!(WsError::HeartbeatTimeout.kind(), "heartbeat_timeout");
        assert_eq!(WsError::RateLimited.kind(), "rate_limited");
        assert_eq!(
            WsError::DuplicateId("7".to_string()).kind(),
            "duplicate_id"
        );
    }
}
