//! Operational counters for the raffle keeper.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated metrics for the keeper's two jobs: cranking settlement
/// triggers and fulfilling randomness requests.
///
/// Thread-safe via atomics; shareable via `Arc<Metrics>`.
pub struct Metrics {
    /// Total number of trigger eligibility polls.
    pub trigger_checks: AtomicU64,
    /// Total number of `perform_trigger` transactions confirmed.
    pub triggers_performed: AtomicU64,
    /// Total number of randomness requests received.
    pub requests_received: AtomicU64,
    /// Total number of requests successfully fulfilled on-chain.
    pub requests_fulfilled: AtomicU64,
    /// Total number of fulfillment attempts that failed permanently.
    pub requests_failed: AtomicU64,
    /// Sum of fulfillment latencies in milliseconds (for computing average).
    pub fulfillment_latency_sum_ms: AtomicU64,
    /// Number of fulfilled requests contributing to latency sum.
    pub fulfillment_count: AtomicU64,
}

impl Metrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            trigger_checks: AtomicU64::new(0),
            triggers_performed: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
            requests_fulfilled: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            fulfillment_latency_sum_ms: AtomicU64::new(0),
            fulfillment_count: AtomicU64::new(0),
        }
    }

    /// Record a trigger eligibility poll.
    pub fn record_trigger_check(&self) {
        self.trigger_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a confirmed `perform_trigger` transaction.
    pub fn record_trigger_performed(&self) {
        self.triggers_performed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new randomness request received.
    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful fulfillment with its latency.
    pub fn record_fulfillment(&self, latency_ms: u64) {
        self.requests_fulfilled.fetch_add(1, Ordering::Relaxed);
        self.fulfillment_latency_sum_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.fulfillment_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed fulfillment.
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Compute average fulfillment latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.fulfillment_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.fulfillment_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "trigger_checks": self.trigger_checks.load(Ordering::Relaxed),
            "triggers_performed": self.triggers_performed.load(Ordering::Relaxed),
            "requests_received": self.requests_received.load(Ordering::Relaxed),
            "requests_fulfilled": self.requests_fulfilled.load(Ordering::Relaxed),
            "requests_failed": self.requests_failed.load(Ordering::Relaxed),
            "avg_fulfillment_latency_ms": self.avg_latency_ms(),
            "fulfillment_count": self.fulfillment_count.load(Ordering::Relaxed),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_over_recorded_fulfillments() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_latency_ms(), 0);

        metrics.record_fulfillment(100);
        metrics.record_fulfillment(300);
        assert_eq!(metrics.avg_latency_ms(), 200);
        assert_eq!(metrics.requests_fulfilled.load(Ordering::Relaxed), 2);
    }
}
