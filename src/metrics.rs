//! Lightweight in-process counters for licensing events.
//!
//! These feed the host's telemetry pipeline; the crate itself only counts.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Counter sink keyed by `category.event.label`.
#[derive(Debug, Default)]
pub struct MetricCounters {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl MetricCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn count(&self, category: &str, event: &str, label: &str) {
        let key = format!("{category}.{event}.{label}");
        tracing::debug!(metric = %key, "count");
        *self.counts.lock().entry(key).or_insert(0) += 1;
    }

    /// Current value of a counter (0 if never incremented).
    pub fn value(&self, category: &str, event: &str, label: &str) -> u64 {
        let key = format!("{category}.{event}.{label}");
        self.counts.lock().get(&key).copied().unwrap_or(0)
    }

    /// Snapshot of all counters, for reporting and tests.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.lock().clone()
    }
}
