//! Pairing session manager.
//!
//! Every session is driven by one tokio task that owns the session's phase,
//! its pending response, the adapter's event receiver and a command channel.
//! The settling timer and the code request run as abortable side tasks that
//! report back over the command channel, so all state changes of a session
//! happen in one place and in arrival order.
//!
//! ```text
//! start_pairing ─► reserve entry ─► store.open ─► adapter.open ─► go live ─► spawn driver
//!       ▲                                                                    │
//!       └─────────────────── oneshot (settled exactly once) ◄────────────────┤
//!                                                                            ▼
//!                    adapter events ──► driver ◄── timer / code request / shutdown
//! ```
//!
//! A table entry is reserved (`Opening`) before any I/O happens and carries
//! the attempt number that reserved it. Purge and shutdown act on reserved
//! entries too; the opening caller notices when it tries to go live and
//! tears its connection down instead of starting a driver.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::error::{PairingError, StoreError};
use crate::observability::{Observer, ObserverEvent, ObserverMetric};
use crate::pairing::code::{PairingCode, mask_phone_number, normalize_phone_number};
use crate::pairing::session::{
    ConnectionPhase, PendingResponse, PhaseEvent, SessionId,
};
use crate::pairing::store::SessionStore;
use crate::protocol::{
    ConnectionState, DisconnectCause, ProtocolAdapter, ProtocolClient, ProtocolEvent,
};

/// Configuration for pairing sessions.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Root directory of the session store.
    pub session_dir: PathBuf,
    /// Grace period between opening the connection and requesting a code.
    pub settle_delay: Duration,
    /// Upper bound on the pairing-code request itself.
    pub request_timeout: Duration,
    /// How long a closed session stays listed before it is forgotten.
    pub closed_retention: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from("./temp"),
            settle_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            closed_retention: Duration::from_secs(600),
        }
    }
}

/// Point-in-time view of a session table entry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub phase: ConnectionPhase,
    /// Phone number with all but the last four digits masked.
    pub phone: String,
    pub created_at: DateTime<Utc>,
    /// Whether the session is still connecting or has a running driver.
    pub live: bool,
}

/// Who is responsible for a session right now.
enum DriverState {
    /// Reserved by a caller that is still opening storage and the connection.
    Opening,
    /// A driver task runs and takes commands here.
    Live(mpsc::UnboundedSender<SessionCommand>),
    /// Nothing runs for this session any more.
    Closed { at: Instant },
}

struct SessionEntry {
    /// Attempt that reserved this entry. Stale callers and drivers leave it alone.
    attempt: u64,
    phase: ConnectionPhase,
    phone: String,
    created_at: DateTime<Utc>,
    driver: DriverState,
}

impl SessionEntry {
    fn opening(attempt: u64, phone: &str) -> Self {
        Self {
            attempt,
            phase: ConnectionPhase::Initializing,
            phone: mask_phone_number(phone),
            created_at: Utc::now(),
            driver: DriverState::Opening,
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self.driver, DriverState::Closed { .. })
    }

    fn retire(&mut self) {
        self.phase = ConnectionPhase::Closed;
        if self.is_active() {
            self.driver = DriverState::Closed { at: Instant::now() };
        }
    }

    fn snapshot(&self, id: &SessionId) -> SessionSnapshot {
        SessionSnapshot {
            id: id.clone(),
            phase: self.phase,
            phone: self.phone.clone(),
            created_at: self.created_at,
            live: self.is_active(),
        }
    }
}

type SessionTable = Arc<RwLock<HashMap<SessionId, SessionEntry>>>;

/// Forget sessions whose driver ended at least `retention` ago.
fn evict_closed(sessions: &mut HashMap<SessionId, SessionEntry>, retention: Duration) {
    let before = sessions.len();
    sessions.retain(|_, entry| match entry.driver {
        DriverState::Closed { at } => at.elapsed() < retention,
        _ => true,
    });
    let evicted = before - sessions.len();
    if evicted > 0 {
        tracing::debug!(evicted, "Evicted closed sessions from the table");
    }
}

/// Run a blocking store operation off the async workers.
async fn store_call<T, F>(store: &Arc<dyn SessionStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn SessionStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn storage_unavailable(e: StoreError) -> PairingError {
    PairingError::ConnectionError(format!("session storage unavailable: {e}"))
}

/// Messages a session's driver receives besides adapter events.
#[derive(Debug)]
enum SessionCommand {
    /// The settling delay elapsed.
    SettleElapsed,
    /// The pairing-code request finished.
    CodeReady(Result<String, PairingError>),
    /// Stop the session, keeping its storage.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

/// Why a reserved session never got a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abandoned {
    ShutDown,
    Purged,
    /// A newer attempt owns the entry now.
    Superseded,
}

impl fmt::Display for Abandoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Abandoned::ShutDown => write!(f, "shut down"),
            Abandoned::Purged => write!(f, "purged"),
            Abandoned::Superseded => write!(f, "superseded"),
        }
    }
}

/// Creates pairing sessions and owns the table of known sessions.
pub struct PairingSessionManager {
    config: PairingConfig,
    store: Arc<dyn SessionStore>,
    adapter: Arc<dyn ProtocolAdapter>,
    observer: Arc<dyn Observer>,
    sessions: SessionTable,
    attempts: AtomicU64,
}

impl PairingSessionManager {
    pub fn new(
        config: PairingConfig,
        store: Arc<dyn SessionStore>,
        adapter: Arc<dyn ProtocolAdapter>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            config,
            store,
            adapter,
            observer,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// Start a new pairing session for `phone_number` and wait for its code.
    ///
    /// Resolves once the session's response is settled: with the formatted
    /// code, or with the error that ended the attempt. The session itself
    /// keeps running in the background after this returns.
    pub async fn start_pairing(&self, phone_number: &str) -> Result<PairingCode, PairingError> {
        let phone = normalize_phone_number(phone_number)?;
        let (id, attempt) = self.allocate_session(&phone).await?;
        self.run_session(id, attempt, phone).await
    }

    /// Reconnect a session whose storage was retained after a non-logout close.
    ///
    /// Already linked credentials settle with [`PairingError::AlreadyRegistered`]
    /// without asking for a new code. A session that is still connecting or
    /// running is rejected.
    pub async fn resume_pairing(
        &self,
        id: &SessionId,
        phone_number: &str,
    ) -> Result<PairingCode, PairingError> {
        let phone = normalize_phone_number(phone_number)?;
        let target = id.clone();
        let known = store_call(&self.store, move |store| Ok(store.exists(&target)))
            .await
            .map_err(storage_unavailable)?;
        if !known {
            return Err(PairingError::InvalidInput(format!("Unknown session: {id}")));
        }

        let attempt = {
            let mut sessions = self.sessions.write().await;
            if sessions.get(id).is_some_and(SessionEntry::is_active) {
                return Err(PairingError::InvalidInput(format!(
                    "Session {id} is already active"
                )));
            }
            evict_closed(&mut sessions, self.config.closed_retention);
            let attempt = self.next_attempt();
            sessions.insert(id.clone(), SessionEntry::opening(attempt, &phone));
            attempt
        };

        self.run_session(id.clone(), attempt, phone).await
    }

    /// Pick an id that is neither in the table nor on disk, and reserve it.
    ///
    /// The disk check runs without the table lock; the table is checked
    /// again before the reservation.
    async fn allocate_session(&self, phone: &str) -> Result<(SessionId, u64), PairingError> {
        loop {
            let candidate = SessionId::generate();
            if self.sessions.read().await.contains_key(&candidate) {
                continue;
            }

            let target = candidate.clone();
            let on_disk = store_call(&self.store, move |store| Ok(store.exists(&target)))
                .await
                .map_err(storage_unavailable)?;
            if on_disk {
                continue;
            }

            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&candidate) {
                continue;
            }
            evict_closed(&mut sessions, self.config.closed_retention);
            let attempt = self.next_attempt();
            sessions.insert(candidate.clone(), SessionEntry::opening(attempt, phone));
            return Ok((candidate, attempt));
        }
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed)
    }

    async fn run_session(
        &self,
        id: SessionId,
        attempt: u64,
        phone: String,
    ) -> Result<PairingCode, PairingError> {
        let started = Instant::now();

        let target = id.clone();
        let credentials = match store_call(&self.store, move |store| store.open(&target)).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Failed to open session storage");
                let mut sessions = self.sessions.write().await;
                if sessions.get(&id).is_some_and(|entry| entry.attempt == attempt) {
                    sessions.remove(&id);
                }
                drop(sessions);
                self.record_error("store", &e.to_string());
                return Err(storage_unavailable(e));
            }
        };
        let stored_registered = credentials.registered();

        let connection = match self.adapter.open(credentials).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to open protocol connection");
                self.mark_closed(&id, attempt).await;
                self.record_error("protocol", &e.to_string());
                return Err(PairingError::ConnectionError(e.to_string()));
            }
        };

        let (pending, response) = PendingResponse::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        if let Err(reason) = self.go_live(&id, attempt, &commands_tx).await {
            connection.client.close().await;
            if reason == Abandoned::Purged {
                let target = id.clone();
                if let Err(e) = store_call(&self.store, move |store| store.purge(&target)).await {
                    tracing::warn!(session_id = %id, error = %e, "Failed to purge session storage");
                }
            }
            tracing::info!(session_id = %id, %reason, "Pairing session abandoned while connecting");
            return Err(PairingError::ConnectionError(format!(
                "session {reason} while connecting"
            )));
        }

        tracing::info!(
            session_id = %id,
            phone = %mask_phone_number(&phone),
            backend = self.adapter.name(),
            "Pairing session started"
        );
        self.observer.record_event(&ObserverEvent::SessionStarted {
            session_id: id.to_string(),
        });
        self.report_active_sessions().await;

        let registered = stored_registered || connection.client.is_registered();
        let driver = SessionDriver {
            id,
            attempt,
            phone,
            phase: ConnectionPhase::Initializing,
            pending,
            client: connection.client,
            events: connection.events,
            commands_rx,
            commands_tx,
            timer: None,
            request: None,
            started,
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            observer: Arc::clone(&self.observer),
            sessions: Arc::clone(&self.sessions),
        };
        tokio::spawn(driver.run(registered));

        match response.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PairingError::ConnectionError(
                "session ended before a pairing code was issued".to_string(),
            )),
        }
    }

    /// Hand a reserved entry over to its driver, unless it was shut down,
    /// purged or taken over while connecting.
    async fn go_live(
        &self,
        id: &SessionId,
        attempt: u64,
        commands: &mpsc::UnboundedSender<SessionCommand>,
    ) -> Result<(), Abandoned> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(entry) if entry.attempt == attempt => match entry.driver {
                DriverState::Opening => {
                    entry.driver = DriverState::Live(commands.clone());
                    Ok(())
                }
                _ => Err(Abandoned::ShutDown),
            },
            Some(_) => Err(Abandoned::Superseded),
            None => Err(Abandoned::Purged),
        }
    }

    /// Look up one session.
    pub async fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.read().await.get(id).map(|entry| entry.snapshot(id))
    }

    /// All sessions the manager knows about, ordered by id.
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshots: Vec<_> = sessions
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Number of sessions that are connecting or have a running driver.
    pub async fn active_sessions(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.is_active())
            .count()
    }

    /// Stop a session if it is running, delete its storage and forget it.
    ///
    /// A session that is still connecting is abandoned by its caller once
    /// the connection comes up.
    pub async fn purge_session(&self, id: &SessionId) -> Result<(), StoreError> {
        let entry = self.sessions.write().await.remove(id);
        if let Some(SessionEntry {
            driver: DriverState::Live(commands),
            ..
        }) = entry
        {
            let _ = commands.send(SessionCommand::Shutdown);
        }
        let target = id.clone();
        store_call(&self.store, move |store| store.purge(&target)).await?;
        tracing::info!(session_id = %id, "Session purged");
        self.report_active_sessions().await;
        Ok(())
    }

    /// Ask every running or connecting session to stop. Storage is kept.
    ///
    /// Returns how many sessions were signalled.
    pub async fn shutdown(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut signalled = 0;
        for entry in sessions.values_mut() {
            if matches!(entry.driver, DriverState::Opening) {
                entry.retire();
                signalled += 1;
            } else if let DriverState::Live(commands) = &entry.driver {
                if commands.send(SessionCommand::Shutdown).is_ok() {
                    signalled += 1;
                }
            }
        }
        tracing::info!(sessions = signalled, "Pairing sessions signalled to stop");
        signalled
    }

    async fn mark_closed(&self, id: &SessionId, attempt: u64) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            if entry.attempt == attempt {
                entry.retire();
            }
        }
    }

    async fn report_active_sessions(&self) {
        let active = self.active_sessions().await as u64;
        self.observer
            .record_metric(&ObserverMetric::ActiveSessions(active));
    }

    fn record_error(&self, component: &str, message: &str) {
        self.observer.record_event(&ObserverEvent::Error {
            component: component.to_string(),
            message: message.to_string(),
        });
    }
}

/// State owned by one session's driver task.
struct SessionDriver {
    id: SessionId,
    attempt: u64,
    phone: String,
    phase: ConnectionPhase,
    pending: PendingResponse,
    client: Arc<dyn ProtocolClient>,
    events: mpsc::Receiver<ProtocolEvent>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    timer: Option<JoinHandle<()>>,
    request: Option<JoinHandle<()>>,
    started: Instant,
    config: PairingConfig,
    store: Arc<dyn SessionStore>,
    observer: Arc<dyn Observer>,
    sessions: SessionTable,
}

impl SessionDriver {
    async fn run(mut self, registered: bool) {
        if registered {
            tracing::info!(session_id = %self.id, "Credentials already registered, no code requested");
            self.pending
                .settle(Err(PairingError::AlreadyRegistered(self.id.clone())));
        } else {
            self.schedule_code_request();
        }

        loop {
            let step = tokio::select! {
                Some(command) = self.commands_rx.recv() => self.on_command(command).await,
                event = self.events.recv() => match event {
                    Some(event) => self.on_protocol_event(event).await,
                    None => self.on_closed(DisconnectCause::ConnectionLost).await,
                },
            };
            if step == Step::Stop {
                break;
            }
        }

        self.cancel_scheduled();
        if self.pending.settle(Err(PairingError::ConnectionError(
            "session ended before a pairing code was issued".to_string(),
        ))) {
            tracing::warn!(session_id = %self.id, "Session ended with an unsettled response");
        }
        self.update_entry(SessionEntry::retire).await;
    }

    /// Apply `f` to this driver's table entry, if it still owns one.
    async fn update_entry(&self, f: impl FnOnce(&mut SessionEntry)) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions
            .get_mut(&self.id)
            .filter(|entry| entry.attempt == self.attempt)
        {
            f(entry);
        }
    }

    fn schedule_code_request(&mut self) {
        let commands = self.commands_tx.clone();
        let delay = self.config.settle_delay;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(SessionCommand::SettleElapsed);
        }));
    }

    fn cancel_scheduled(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(request) = self.request.take() {
            request.abort();
        }
    }

    async fn on_command(&mut self, command: SessionCommand) -> Step {
        match command {
            SessionCommand::SettleElapsed => {
                self.timer = None;
                if self.phase.is_closed() || self.pending.is_settled() {
                    tracing::debug!(session_id = %self.id, "Settle delay elapsed on a finished session, ignoring");
                    return Step::Continue;
                }
                self.request_code().await;
                Step::Continue
            }
            SessionCommand::CodeReady(Ok(raw)) => {
                self.request = None;
                let code = PairingCode::from_raw(&raw);
                if self.pending.settle(Ok(code)) {
                    let elapsed = self.started.elapsed();
                    tracing::info!(
                        session_id = %self.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Pairing code issued"
                    );
                    self.observer.record_event(&ObserverEvent::PairingCodeIssued {
                        session_id: self.id.to_string(),
                        duration: elapsed,
                    });
                    self.observer
                        .record_metric(&ObserverMetric::RequestLatency(elapsed));
                }
                Step::Continue
            }
            SessionCommand::CodeReady(Err(err)) => {
                self.request = None;
                tracing::warn!(session_id = %self.id, error = %err, "Pairing code request failed");
                self.pending.settle(Err(err));
                self.client.close().await;
                self.finish_closed("pairing request failed", false).await;
                Step::Stop
            }
            SessionCommand::Shutdown => {
                self.cancel_scheduled();
                self.pending.settle(Err(PairingError::ConnectionError(
                    "session shut down".to_string(),
                )));
                self.client.close().await;
                self.finish_closed("shutdown", false).await;
                Step::Stop
            }
        }
    }

    async fn request_code(&mut self) {
        self.transition(PhaseEvent::CodeRequested).await;

        let client = Arc::clone(&self.client);
        let phone = self.phone.clone();
        let commands = self.commands_tx.clone();
        let timeout = self.config.request_timeout;
        tracing::debug!(session_id = %self.id, "Requesting pairing code");

        self.request = Some(tokio::spawn(async move {
            let outcome =
                match tokio::time::timeout(timeout, client.request_pairing_code(&phone)).await {
                    Ok(Ok(raw)) => Ok(raw),
                    Ok(Err(e)) => Err(PairingError::PairingRequestFailed(e.to_string())),
                    Err(_) => Err(PairingError::PairingRequestFailed(format!(
                        "no pairing code within {}ms",
                        timeout.as_millis()
                    ))),
                };
            let _ = commands.send(SessionCommand::CodeReady(outcome));
        }));
    }

    async fn on_protocol_event(&mut self, event: ProtocolEvent) -> Step {
        match event {
            ProtocolEvent::CredsUpdate(delta) => {
                let target = self.id.clone();
                let saved =
                    store_call(&self.store, move |store| store.save(&target, &delta)).await;
                if let Err(e) = saved {
                    tracing::warn!(session_id = %self.id, error = %e, "Failed to save credentials");
                    self.observer.record_event(&ObserverEvent::Error {
                        component: "store".to_string(),
                        message: e.to_string(),
                    });
                }
                Step::Continue
            }
            ProtocolEvent::ConnectionUpdate(ConnectionState::Connecting) => {
                self.transition(PhaseEvent::Connecting).await;
                Step::Continue
            }
            ProtocolEvent::ConnectionUpdate(ConnectionState::Open) => {
                self.transition(PhaseEvent::Opened).await;
                tracing::info!(session_id = %self.id, "Device linked");
                self.observer.record_event(&ObserverEvent::SessionLinked {
                    session_id: self.id.to_string(),
                });
                Step::Continue
            }
            ProtocolEvent::ConnectionUpdate(ConnectionState::Close(cause)) => {
                self.on_closed(cause).await
            }
        }
    }

    async fn on_closed(&mut self, cause: DisconnectCause) -> Step {
        self.cancel_scheduled();
        self.pending.settle(Err(PairingError::ConnectionError(format!(
            "connection closed before a pairing code was issued: {cause}"
        ))));

        let purged = if cause.is_logged_out() {
            let target = self.id.clone();
            match store_call(&self.store, move |store| store.purge(&target)).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(session_id = %self.id, error = %e, "Failed to purge session storage");
                    false
                }
            }
        } else {
            false
        };

        self.finish_closed(&cause.to_string(), purged).await;
        Step::Stop
    }

    /// Move to `Closed`, update the table and report.
    async fn finish_closed(&mut self, cause: &str, purged: bool) {
        self.transition(PhaseEvent::Closed).await;
        if purged {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(&self.id)
                .is_some_and(|entry| entry.attempt == self.attempt)
            {
                sessions.remove(&self.id);
            }
        } else {
            self.update_entry(SessionEntry::retire).await;
        }

        tracing::info!(
            session_id = %self.id,
            cause,
            purged,
            "Pairing session closed"
        );
        self.observer.record_event(&ObserverEvent::SessionClosed {
            session_id: self.id.to_string(),
            cause: cause.to_string(),
            purged,
        });
    }

    async fn transition(&mut self, event: PhaseEvent) {
        let next = self.phase.next(event);
        if next == self.phase {
            return;
        }
        tracing::debug!(session_id = %self.id, from = %self.phase, to = %next, "Phase change");
        self.phase = next;
        self.update_entry(|entry| entry.phase = next).await;
    }
}
