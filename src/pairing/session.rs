//! Session identity, connection phases and the single-assignment response slot.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{PairingError, StoreError};
use crate::pairing::code::PairingCode;

const SESSION_SUFFIX_LENGTH: usize = 6;
const SESSION_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque session identifier: `<unix-millis>-<base36 suffix>`.
///
/// Doubles as the storage namespace, so it can only be built through
/// [`SessionId::generate`] or the validating [`SessionId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier from the current time and a random suffix.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SESSION_SUFFIX_LENGTH)
            .map(|_| {
                let idx = rng.gen_range(0..SESSION_SUFFIX_ALPHABET.len());
                SESSION_SUFFIX_ALPHABET[idx] as char
            })
            .collect();
        Self(format!("{millis}-{suffix}"))
    }

    /// Parse an identifier coming from outside the process (CLI, directory names).
    ///
    /// Rejects anything that could escape the session directory.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(StoreError::InvalidSessionId("empty".to_string()));
        }
        let unsafe_char = id
            .chars()
            .any(|c| matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'));
        if unsafe_char || id.contains("..") || id.starts_with('.') {
            return Err(StoreError::InvalidSessionId(raw.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Where a session's connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Initializing,
    AwaitingCode,
    Connected,
    Closed,
}

/// Inputs to the phase transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// The manager issued the pairing-code request.
    CodeRequested,
    /// The adapter reports the socket is (re)connecting.
    Connecting,
    /// The adapter reports the account is linked and the socket open.
    Opened,
    /// The connection is gone, for whatever reason.
    Closed,
}

impl ConnectionPhase {
    /// Apply one event. `Closed` is absorbing.
    pub fn next(self, event: PhaseEvent) -> Self {
        match (self, event) {
            (Self::Closed, _) => Self::Closed,
            (_, PhaseEvent::Closed) => Self::Closed,
            (_, PhaseEvent::Opened) => Self::Connected,
            (Self::Initializing, PhaseEvent::CodeRequested) => Self::AwaitingCode,
            (phase, PhaseEvent::CodeRequested | PhaseEvent::Connecting) => phase,
        }
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AwaitingCode => "awaiting_code",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final answer delivered to a `start_pairing` caller.
pub type PairingOutcome = Result<PairingCode, PairingError>;

/// Single-assignment slot for the caller-facing response.
///
/// The first [`settle`](Self::settle) delivers the outcome; every later call
/// is a no-op and returns `false`.
#[derive(Debug)]
pub struct PendingResponse {
    tx: Option<oneshot::Sender<PairingOutcome>>,
}

impl PendingResponse {
    pub fn new() -> (Self, oneshot::Receiver<PairingOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver `outcome` if nothing was delivered yet. A caller that already
    /// hung up still counts as settled.
    pub fn settle(&mut self, outcome: PairingOutcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tx.is_none()
    }
}
