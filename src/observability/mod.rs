//! Observability subsystem: trait-based event and metric recording.
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Discards everything |
//! | `log`   | Emits structured events via `tracing` (default) |
mod log;
mod noop;
pub mod traits;

pub use self::log::LogObserver;
pub use self::noop::NoopObserver;
pub use self::traits::{Observer, ObserverEvent, ObserverMetric};

use std::sync::Arc;

/// Configuration for the observability backend.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Backend name: "none", "noop", "log".
    pub backend: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: "log".into(),
        }
    }
}

/// Create an observer from configuration.
///
/// Returns a [`LogObserver`] for "log" and a [`NoopObserver`] for anything else.
pub fn create_observer(config: &ObservabilityConfig) -> Arc<dyn Observer> {
    match config.backend.as_str() {
        "log" => Arc::new(LogObserver),
        _ => Arc::new(NoopObserver),
    }
}

#[cfg(test)]
mod tests {
    use crate::observability::*;

    #[test]
    fn default_config_is_log() {
        let cfg = ObservabilityConfig::default();
        assert_eq!(cfg.backend, "log");
        assert_eq!(create_observer(&cfg).name(), "log");
    }

    #[test]
    fn factory_returns_noop_for_none() {
        let cfg = ObservabilityConfig {
            backend: "none".into(),
        };
        assert_eq!(create_observer(&cfg).name(), "noop");
    }

    #[test]
    fn factory_returns_noop_for_unknown() {
        let cfg = ObservabilityConfig {
            backend: "prometheus".into(),
        };
        assert_eq!(create_observer(&cfg).name(), "noop");
    }
}
