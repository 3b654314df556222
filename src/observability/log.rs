//! Tracing-based observer that emits structured log events.
//!
//! Uses the existing `tracing` infrastructure so events appear alongside
//! normal application logs, with no extra dependencies.
use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that logs events and metrics via `tracing`.
pub struct LogObserver;

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::SessionStarted { session_id } => {
                tracing::info!(session_id, "observer: session.start");
            }
            ObserverEvent::PairingCodeIssued {
                session_id,
                duration,
            } => {
                tracing::info!(
                    session_id,
                    duration_ms = duration.as_millis() as u64,
                    "observer: pairing.code"
                );
            }
            ObserverEvent::SessionLinked { session_id } => {
                tracing::info!(session_id, "observer: session.linked");
            }
            ObserverEvent::SessionClosed {
                session_id,
                cause,
                purged,
            } => {
                tracing::info!(session_id, cause, purged, "observer: session.closed");
            }
            ObserverEvent::Error { component, message } => {
                tracing::warn!(component, error = message.as_str(), "observer: error");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::RequestLatency(d) => {
                tracing::debug!(
                    latency_ms = d.as_millis() as u64,
                    "observer: metric.request_latency"
                );
            }
            ObserverMetric::ActiveSessions(n) => {
                tracing::debug!(active_sessions = n, "observer: metric.active_sessions");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::observability::log::LogObserver;
    use crate::observability::traits::*;

    #[test]
    fn name_is_log() {
        assert_eq!(LogObserver.name(), "log");
    }

    #[test]
    fn record_event_does_not_panic() {
        let obs = LogObserver;
        obs.record_event(&ObserverEvent::SessionStarted {
            session_id: "s1".into(),
        });
        obs.record_event(&ObserverEvent::PairingCodeIssued {
            session_id: "s1".into(),
            duration: Duration::from_millis(3050),
        });
        obs.record_event(&ObserverEvent::SessionLinked {
            session_id: "s1".into(),
        });
        obs.record_event(&ObserverEvent::SessionClosed {
            session_id: "s1".into(),
            cause: "network timeout".into(),
            purged: false,
        });
        obs.record_event(&ObserverEvent::Error {
            component: "store".into(),
            message: "permission denied".into(),
        });
    }

    #[test]
    fn record_metric_does_not_panic() {
        let obs = LogObserver;
        obs.record_metric(&ObserverMetric::RequestLatency(Duration::from_millis(200)));
        obs.record_metric(&ObserverMetric::ActiveSessions(5));
    }

    #[test]
    fn flush_does_not_panic() {
        LogObserver.flush();
    }
}
