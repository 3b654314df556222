//! Error types for pairlink.

use crate::pairing::SessionId;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by a protocol adapter.
///
/// These never leave the pairing manager; they are folded into
/// [`PairingError`] first.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Request rejected: {0}")]
    RequestRejected(String),

    #[error("Connection closed")]
    Closed,
}

/// Outcome errors of a pairing request, as seen by callers of the manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Pairing request failed: {0}")]
    PairingRequestFailed(String),

    #[error("Session {0} is already registered")]
    AlreadyRegistered(SessionId),
}

impl PairingError {
    /// Whether the caller caused the failure (bad input) rather than the service.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}

/// HTTP gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway failed to start: {reason}")]
    StartupFailed { reason: String },
}
