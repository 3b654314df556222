//! Protocol adapter abstraction for the remote messaging service.
//!
//! The wire protocol itself lives outside this crate. An adapter opens a
//! connection from a session's stored credentials and hands back two things:
//! a [`ProtocolClient`] for requests, and the receiving end of the
//! connection's event stream. Events are buffered from the moment the
//! connection exists, so whoever owns the receiver sees every event in order.
//!
//! Supported backends:
//! - **loopback** - in-process stand-in for development and tests
mod loopback;

pub use loopback::{LoopbackAdapter, LoopbackCode, LoopbackScript};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{AdapterError, ConfigError};
use crate::pairing::{CredentialDelta, CredentialHandle};

/// Capacity of the per-connection event buffer.
pub const EVENT_BUFFER: usize = 64;

// ── Disconnect causes ───────────────────────────────────────────

/// Why the remote service dropped a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    LoggedOut,
    BadSession,
    RestartRequired,
    MultideviceMismatch,
    Forbidden,
    UnavailableService,
    Other(u16),
    Unknown,
}

impl DisconnectCause {
    /// Decode the status code attached to a close. `408` is reported for both
    /// lost and timed-out connections and decodes as [`Self::TimedOut`].
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            None => Self::Unknown,
            Some(401) => Self::LoggedOut,
            Some(403) => Self::Forbidden,
            Some(408) => Self::TimedOut,
            Some(411) => Self::MultideviceMismatch,
            Some(428) => Self::ConnectionClosed,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(503) => Self::UnavailableService,
            Some(515) => Self::RestartRequired,
            Some(other) => Self::Other(other),
        }
    }

    pub fn status_code(self) -> Option<u16> {
        match self {
            Self::ConnectionClosed => Some(428),
            Self::ConnectionLost | Self::TimedOut => Some(408),
            Self::ConnectionReplaced => Some(440),
            Self::LoggedOut => Some(401),
            Self::BadSession => Some(500),
            Self::RestartRequired => Some(515),
            Self::MultideviceMismatch => Some(411),
            Self::Forbidden => Some(403),
            Self::UnavailableService => Some(503),
            Self::Other(code) => Some(code),
            Self::Unknown => None,
        }
    }

    /// An authoritative logout: the credentials are dead and must be purged.
    /// Every other cause is treated as transient.
    pub fn is_logged_out(self) -> bool {
        self == Self::LoggedOut
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::ConnectionReplaced => write!(f, "connection replaced"),
            Self::TimedOut => write!(f, "network timeout"),
            Self::LoggedOut => write!(f, "logged out"),
            Self::BadSession => write!(f, "bad session"),
            Self::RestartRequired => write!(f, "restart required"),
            Self::MultideviceMismatch => write!(f, "multi-device mismatch"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::UnavailableService => write!(f, "service unavailable"),
            Self::Other(code) => write!(f, "status {code}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Connection state reported by a `connection.update` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close(DisconnectCause),
}

/// Events emitted by an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// `connection.update`
    ConnectionUpdate(ConnectionState),
    /// `creds.update`
    CredsUpdate(CredentialDelta),
}

impl ProtocolEvent {
    pub fn closed(cause: DisconnectCause) -> Self {
        Self::ConnectionUpdate(ConnectionState::Close(cause))
    }
}

// ── Adapter traits ───────────────────────────────────────────────

/// Request side of an open connection.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Whether the credentials this connection was opened with are already
    /// linked to an account.
    fn is_registered(&self) -> bool;

    /// Ask the remote service for a pairing code for `phone_number` (digits only).
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, AdapterError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// An open connection: its client plus its event stream.
pub struct Connection {
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Opens connections to the remote messaging service.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Human-readable backend name (e.g. "loopback").
    fn name(&self) -> &str;

    /// Open a connection authenticated with `credentials`.
    async fn open(&self, credentials: CredentialHandle) -> Result<Connection, AdapterError>;
}

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolBackend {
    #[default]
    Loopback,
}

impl std::str::FromStr for ProtocolBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "loopback" | "local" => Ok(Self::Loopback),
            _ => Err(ConfigError::InvalidValue {
                key: "PROTOCOL_BACKEND".to_string(),
                message: format!("unknown backend: {s}, expected 'loopback'"),
            }),
        }
    }
}

/// Protocol adapter configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub backend: ProtocolBackend,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            backend: ProtocolBackend::default(),
        }
    }
}

/// Build the adapter selected by `config`.
pub fn create_adapter(config: &ProtocolConfig) -> Arc<dyn ProtocolAdapter> {
    match config.backend {
        ProtocolBackend::Loopback => Arc::new(LoopbackAdapter::new(LoopbackScript::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_decode() {
        assert_eq!(
            DisconnectCause::from_status_code(Some(401)),
            DisconnectCause::LoggedOut
        );
        assert_eq!(
            DisconnectCause::from_status_code(Some(408)),
            DisconnectCause::TimedOut
        );
        assert_eq!(
            DisconnectCause::from_status_code(Some(515)),
            DisconnectCause::RestartRequired
        );
        assert_eq!(
            DisconnectCause::from_status_code(Some(999)),
            DisconnectCause::Other(999)
        );
        assert_eq!(
            DisconnectCause::from_status_code(None),
            DisconnectCause::Unknown
        );
    }

    #[test]
    fn test_status_code_round_trip_for_named_causes() {
        for cause in [
            DisconnectCause::ConnectionClosed,
            DisconnectCause::ConnectionReplaced,
            DisconnectCause::LoggedOut,
            DisconnectCause::BadSession,
            DisconnectCause::RestartRequired,
            DisconnectCause::MultideviceMismatch,
            DisconnectCause::Forbidden,
            DisconnectCause::UnavailableService,
        ] {
            assert_eq!(DisconnectCause::from_status_code(cause.status_code()), cause);
        }
        assert_eq!(DisconnectCause::ConnectionLost.status_code(), Some(408));
    }

    #[test]
    fn test_only_logout_is_authoritative() {
        assert!(DisconnectCause::LoggedOut.is_logged_out());
        assert!(!DisconnectCause::TimedOut.is_logged_out());
        assert!(!DisconnectCause::ConnectionLost.is_logged_out());
        assert!(!DisconnectCause::BadSession.is_logged_out());
        assert!(!DisconnectCause::Other(401 + 1).is_logged_out());
        assert!(!DisconnectCause::Unknown.is_logged_out());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!(
            "loopback".parse::<ProtocolBackend>().unwrap(),
            ProtocolBackend::Loopback
        );
        assert_eq!(
            "LOCAL".parse::<ProtocolBackend>().unwrap(),
            ProtocolBackend::Loopback
        );
        assert!("baileys".parse::<ProtocolBackend>().is_err());
    }

    #[test]
    fn test_factory_builds_loopback() {
        let adapter = create_adapter(&ProtocolConfig::default());
        assert_eq!(adapter.name(), "loopback");
    }
}
