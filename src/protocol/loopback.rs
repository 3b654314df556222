//! In-process protocol backend.
//!
//! Follows a [`LoopbackScript`] instead of talking to a real service: it can
//! fail to connect, emit a fixed set of events on open, answer the code
//! request with a fixed, random or failing result, and emit further events
//! once a code has been handed out. Counts opens and code requests so tests
//! can assert on network activity.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::AdapterError;
use crate::pairing::{CredentialDelta, CredentialHandle};
use crate::protocol::{
    Connection, ConnectionState, EVENT_BUFFER, ProtocolAdapter, ProtocolClient, ProtocolEvent,
};

const LOOPBACK_CODE_LENGTH: usize = 8;
const LOOPBACK_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..LOOPBACK_CODE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..LOOPBACK_CODE_ALPHABET.len());
            LOOPBACK_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// How the loopback answers a pairing-code request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackCode {
    Random,
    Fixed(String),
    Fail(String),
}

/// Scripted behaviour of a [`LoopbackAdapter`].
#[derive(Debug, Clone)]
pub struct LoopbackScript {
    pub connect_error: Option<String>,
    /// How long `open` takes before the connection is handed out.
    pub open_latency: Duration,
    pub on_open: Vec<ProtocolEvent>,
    pub code: LoopbackCode,
    pub code_latency: Duration,
    pub after_code: Vec<ProtocolEvent>,
    pub after_code_delay: Duration,
    /// Report the connection as registered regardless of stored credentials.
    pub registered: bool,
}

impl Default for LoopbackScript {
    /// Connects, hands out a random code, then reports the device linked.
    fn default() -> Self {
        Self {
            connect_error: None,
            open_latency: Duration::ZERO,
            on_open: vec![
                ProtocolEvent::ConnectionUpdate(ConnectionState::Connecting),
                ProtocolEvent::CredsUpdate(
                    CredentialDelta::new()
                        .with("registrationId", rand::thread_rng().gen_range(1..16380))
                        .with("advSecretKey", random_code()),
                ),
            ],
            code: LoopbackCode::Random,
            code_latency: Duration::ZERO,
            after_code: vec![
                ProtocolEvent::CredsUpdate(CredentialDelta::registered(true)),
                ProtocolEvent::ConnectionUpdate(ConnectionState::Open),
            ],
            after_code_delay: Duration::from_secs(1),
            registered: false,
        }
    }
}

impl LoopbackScript {
    /// A script with no events at all; every knob starts quiet.
    pub fn quiet() -> Self {
        Self {
            connect_error: None,
            open_latency: Duration::ZERO,
            on_open: Vec::new(),
            code: LoopbackCode::Random,
            code_latency: Duration::ZERO,
            after_code: Vec::new(),
            after_code_delay: Duration::ZERO,
            registered: false,
        }
    }

    pub fn with_code(mut self, raw: impl Into<String>) -> Self {
        self.code = LoopbackCode::Fixed(raw.into());
        self
    }

    pub fn failing_code(mut self, reason: impl Into<String>) -> Self {
        self.code = LoopbackCode::Fail(reason.into());
        self
    }

    pub fn failing_connect(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    pub fn open_latency(mut self, latency: Duration) -> Self {
        self.open_latency = latency;
        self
    }

    pub fn on_open(mut self, events: Vec<ProtocolEvent>) -> Self {
        self.on_open = events;
        self
    }

    pub fn after_code(mut self, events: Vec<ProtocolEvent>) -> Self {
        self.after_code = events;
        self
    }

    pub fn code_latency(mut self, latency: Duration) -> Self {
        self.code_latency = latency;
        self
    }

    pub fn after_code_delay(mut self, delay: Duration) -> Self {
        self.after_code_delay = delay;
        self
    }

    pub fn already_registered(mut self) -> Self {
        self.registered = true;
        self
    }
}

/// Scriptable in-process adapter.
pub struct LoopbackAdapter {
    script: LoopbackScript,
    opened: AtomicUsize,
    code_requests: Arc<AtomicUsize>,
}

impl LoopbackAdapter {
    pub fn new(script: LoopbackScript) -> Self {
        Self {
            script,
            opened: AtomicUsize::new(0),
            code_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `open` calls so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of pairing-code requests that reached the adapter.
    pub fn code_request_count(&self) -> usize {
        self.code_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolAdapter for LoopbackAdapter {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn open(&self, credentials: CredentialHandle) -> Result<Connection, AdapterError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if !self.script.open_latency.is_zero() {
            tokio::time::sleep(self.script.open_latency).await;
        }
        if let Some(reason) = &self.script.connect_error {
            return Err(AdapterError::ConnectFailed(reason.clone()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        for event in &self.script.on_open {
            if tx.try_send(event.clone()).is_err() {
                tracing::warn!(
                    session_id = %credentials.session_id,
                    "Loopback event buffer full, dropping scripted event"
                );
            }
        }

        let client = LoopbackClient {
            tx,
            script: self.script.clone(),
            registered: self.script.registered || credentials.registered(),
            code_requests: Arc::clone(&self.code_requests),
            closed: AtomicBool::new(false),
        };

        Ok(Connection {
            client: Arc::new(client),
            events: rx,
        })
    }
}

struct LoopbackClient {
    tx: mpsc::Sender<ProtocolEvent>,
    script: LoopbackScript,
    registered: bool,
    code_requests: Arc<AtomicUsize>,
    closed: AtomicBool,
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, AdapterError> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        if phone_number.is_empty() {
            return Err(AdapterError::RequestRejected("empty phone number".to_string()));
        }

        if !self.script.code_latency.is_zero() {
            tokio::time::sleep(self.script.code_latency).await;
        }

        let raw = match &self.script.code {
            LoopbackCode::Random => random_code(),
            LoopbackCode::Fixed(code) => code.clone(),
            LoopbackCode::Fail(reason) => {
                return Err(AdapterError::RequestRejected(reason.clone()));
            }
        };

        if !self.script.after_code.is_empty() {
            let tx = self.tx.clone();
            let events = self.script.after_code.clone();
            let delay = self.script.after_code_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for event in events {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(raw)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
