//! No-op observer.
use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that discards all events and metrics.
pub struct NoopObserver;

impl Observer for NoopObserver {
    #[inline(always)]
    fn record_event(&self, _event: &ObserverEvent) {}

    #[inline(always)]
    fn record_metric(&self, _metric: &ObserverMetric) {}

    fn name(&self) -> &str {
        "noop"
    }
}
