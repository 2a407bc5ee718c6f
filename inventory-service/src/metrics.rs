//! Consumer outcome metrics.
//!
//! Every outcome goes to the `metrics` facade (scraped through the Prometheus
//! exporter installed in `main`) and to an in-process tally that the health
//! endpoint and tests read back.
//!
//! Counter keys follow `<handler>_<outcome>`, e.g. `reserveInventory_failed`.

use metrics::{describe_counter, describe_histogram};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

pub const EVENTS_TOTAL: &str = "inventory_consumer_events_total";
pub const EVENT_DURATION: &str = "inventory_consumer_event_duration_seconds";

pub fn describe() {
    describe_counter!(
        EVENTS_TOTAL,
        "Inventory events consumed, by handler, outcome and reason"
    );
    describe_histogram!(
        EVENT_DURATION,
        "Time spent processing a successfully handled inventory event"
    );
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub total_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub durations: BTreeMap<String, DurationStats>,
}

#[derive(Default)]
pub struct ConsumerMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    durations: Mutex<BTreeMap<String, DurationStats>>,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key: String) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        *counters.entry(key).or_insert(0) += 1;
    }

    pub fn record_success(&self, handler: &str, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        metrics::counter!(EVENTS_TOTAL, "handler" => handler.to_string(), "outcome" => "success").increment(1);
        metrics::histogram!(EVENT_DURATION, "handler" => handler.to_string()).record(secs);

        self.bump(format!("{handler}_success"));
        let mut durations = self.durations.lock().unwrap_or_else(|p| p.into_inner());
        let stats = durations.entry(handler.to_string()).or_default();
        stats.count += 1;
        stats.total_secs += secs;
        stats.max_secs = stats.max_secs.max(secs);
    }

    pub fn record_failure(&self, handler: &str, reason: &str) {
        metrics::counter!(
            EVENTS_TOTAL,
            "handler" => handler.to_string(),
            "outcome" => "failed",
            "reason" => reason.to_string()
        )
        .increment(1);
        self.bump(format!("{handler}_failed"));
        self.bump(format!("{handler}_failed:{reason}"));
    }

    pub fn record_exception(&self, handler: &str) {
        metrics::counter!(EVENTS_TOTAL, "handler" => handler.to_string(), "outcome" => "exception").increment(1);
        self.bump(format!("{handler}_exception"));
    }

    pub fn record_invalid(&self, handler: &str) {
        metrics::counter!(EVENTS_TOTAL, "handler" => handler.to_string(), "outcome" => "invalid_event").increment(1);
        self.bump(format!("{handler}_invalid_event"));
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            durations: self.durations.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_counted_overall_and_per_reason() {
        let metrics = ConsumerMetrics::new();
        metrics.record_failure("reserveInventory", "INSUFFICIENT_STOCK");
        metrics.record_failure("reserveInventory", "PRODUCT_NOT_FOUND");

        assert_eq!(metrics.count("reserveInventory_failed"), 2);
        assert_eq!(metrics.count("reserveInventory_failed:INSUFFICIENT_STOCK"), 1);
        assert_eq!(metrics.count("reserveInventory_success"), 0);
    }

    #[test]
    fn durations_track_count_and_max() {
        let metrics = ConsumerMetrics::new();
        metrics.record_success("releaseInventory", Duration::from_millis(20));
        metrics.record_success("releaseInventory", Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        let stats = snapshot.durations["releaseInventory"];
        assert_eq!(stats.count, 2);
        assert!((stats.max_secs - 0.020).abs() < 1e-9);
        assert_eq!(snapshot.counters["releaseInventory_success"], 2);
    }
}
