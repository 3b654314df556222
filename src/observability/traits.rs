//! Core observer trait and event/metric types.
use std::time::Duration;

/// Backend-agnostic observer for pairing session lifecycle events and metrics.
///
/// The pairing manager records events at key lifecycle points and the
/// observer decides what to do with them.
///
/// Thread-safe and cheaply cloneable behind `Arc<dyn Observer>`.
pub trait Observer: Send + Sync {
    /// Record a discrete lifecycle event.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// Discrete lifecycle events of a pairing session.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A session was allocated and its connection opened.
    SessionStarted { session_id: String },

    /// A pairing code was handed back to the caller.
    PairingCodeIssued {
        session_id: String,
        duration: Duration,
    },

    /// The remote service reported the device linked.
    SessionLinked { session_id: String },

    /// The connection closed; `purged` tells whether storage was deleted.
    SessionClosed {
        session_id: String,
        cause: String,
        purged: bool,
    },

    /// An error occurred in a component.
    Error { component: String, message: String },
}

/// Numeric metric samples.
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    /// Time from request to pairing code (histogram-style).
    RequestLatency(Duration),

    /// Sessions currently tracked by the manager (gauge).
    ActiveSessions(u64),
}
