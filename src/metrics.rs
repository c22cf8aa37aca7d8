//! Bridge metrics for monitoring and observability.
//!
//! Counters are plain atomics updated from whichever thread does the work:
//! workers record native calls, the event bridge records event flow and the
//! control thread records completions and callback failures.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Asynchronous calls handed to the worker pool
    pub calls_submitted: u64,
    /// Asynchronous calls whose completion ran on the control thread
    pub calls_completed: u64,
    /// Synchronous calls
    pub sync_calls: u64,
    /// Events received from the native library
    pub events_received: u64,
    /// Events handed to a host listener
    pub events_delivered: u64,
    /// Events dropped because their listener was gone
    pub events_dropped: u64,
    /// Host callbacks that raised
    pub callback_failures: u64,
    /// Average native call time in microseconds
    pub avg_native_time_us: f64,
}

/// Metrics collector shared by every part of a bridge
pub struct BridgeMetrics {
    calls_submitted: AtomicU64,
    calls_completed: AtomicU64,
    sync_calls: AtomicU64,
    events_received: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    callback_failures: AtomicU64,
    native_calls: AtomicU64,
    native_time_us: AtomicU64,
    native_calls_by_name: parking_lot::Mutex<HashMap<&'static str, u64>>,
}

impl BridgeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            calls_submitted: AtomicU64::new(0),
            calls_completed: AtomicU64::new(0),
            sync_calls: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
            native_calls: AtomicU64::new(0),
            native_time_us: AtomicU64::new(0),
            native_calls_by_name: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record an asynchronous submission
    pub fn record_submitted(&self) {
        self.calls_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an asynchronous completion
    pub fn record_completed(&self) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a synchronous call
    pub fn record_sync_call(&self) {
        self.sync_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one native call and how long it blocked
    pub fn record_native_call(&self, function: &'static str, elapsed: Duration) {
        self.native_calls.fetch_add(1, Ordering::Relaxed);
        self.native_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        *self.native_calls_by_name.lock().entry(function).or_insert(0) += 1;
    }

    /// Record an event arriving from the native library
    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event handed to a listener
    pub fn record_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event dropped for a missing listener
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a host callback that raised
    pub fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average native call time in microseconds
    pub fn avg_native_time_us(&self) -> f64 {
        let total = self.native_calls.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.native_time_us.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Get native call counts per function
    pub fn native_calls(&self) -> HashMap<&'static str, u64> {
        self.native_calls_by_name.lock().clone()
    }

    /// Snapshot every counter
    pub fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            calls_submitted: self.calls_submitted.load(Ordering::Relaxed),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            sync_calls: self.sync_calls.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            avg_native_time_us: self.avg_native_time_us(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.calls_submitted.store(0, Ordering::Relaxed);
        self.calls_completed.store(0, Ordering::Relaxed);
        self.sync_calls.store(0, Ordering::Relaxed);
        self.events_received.store(0, Ordering::Relaxed);
        self.events_delivered.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        self.callback_failures.store(0, Ordering::Relaxed);
        self.native_calls.store(0, Ordering::Relaxed);
        self.native_time_us.store(0, Ordering::Relaxed);
        self.native_calls_by_name.lock().clear();
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let stats = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP telldus_bridge_calls_total Calls by dispatch mode\n");
        output.push_str("# TYPE telldus_bridge_calls_total counter\n");
        output.push_str(&format!(
            "telldus_bridge_calls_total{{mode=\"async\"}} {}\n",
            stats.calls_submitted
        ));
        output.push_str(&format!(
            "telldus_bridge_calls_total{{mode=\"sync\"}} {}\n",
            stats.sync_calls
        ));

        output.push_str(
            "\n# HELP telldus_bridge_completions_total Completions run on the control thread\n",
        );
        output.push_str("# TYPE telldus_bridge_completions_total counter\n");
        output.push_str(&format!(
            "telldus_bridge_completions_total {}\n",
            stats.calls_completed
        ));

        output.push_str("\n# HELP telldus_bridge_events_total Native events by outcome\n");
        output.push_str("# TYPE telldus_bridge_events_total counter\n");
        for (outcome, count) in [
            ("received", stats.events_received),
            ("delivered", stats.events_delivered),
            ("dropped", stats.events_dropped),
        ] {
            output.push_str(&format!(
                "telldus_bridge_events_total{{outcome=\"{}\"}} {}\n",
                outcome, count
            ));
        }

        output.push_str(
            "\n# HELP telldus_bridge_callback_failures_total Host callbacks that raised\n",
        );
        output.push_str("# TYPE telldus_bridge_callback_failures_total counter\n");
        output.push_str(&format!(
            "telldus_bridge_callback_failures_total {}\n",
            stats.callback_failures
        ));

        output.push_str("\n# HELP telldus_bridge_native_time_us Average native call time\n");
        output.push_str("# TYPE telldus_bridge_native_time_us gauge\n");
        output.push_str(&format!(
            "telldus_bridge_native_time_us {:.2}\n",
            stats.avg_native_time_us
        ));

        output.push_str("\n# HELP telldus_bridge_native_calls_total Native calls by function\n");
        output.push_str("# TYPE telldus_bridge_native_calls_total counter\n");
        let mut by_name: Vec<_> = self.native_calls().into_iter().collect();
        by_name.sort_unstable();
        for (name, count) in by_name {
            output.push_str(&format!(
                "telldus_bridge_native_calls_total{{function=\"{}\"}} {}\n",
                name, count
            ));
        }

        output
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer around one blocking native call
pub struct CallTimer {
    function: &'static str,
    start: Instant,
}

impl CallTimer {
    /// Start timing a call to `function`
    pub fn start(function: &'static str) -> Self {
        Self {
            function,
            start: Instant::now(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and record the call
    pub fn finish(self, metrics: &BridgeMetrics) {
        metrics.record_native_call(self.function, self.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = BridgeMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_completed();
        metrics.record_event_received();
        metrics.record_event_dropped();

        let stats = metrics.snapshot();
        assert_eq!(stats.calls_submitted, 2);
        assert_eq!(stats.calls_completed, 1);
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(stats.events_delivered, 0);
    }

    #[test]
    fn test_native_time_average() {
        let metrics = BridgeMetrics::new();
        metrics.record_native_call("tdTurnOn", Duration::from_micros(100));
        metrics.record_native_call("tdTurnOn", Duration::from_micros(300));

        assert!((metrics.avg_native_time_us() - 200.0).abs() < f64::EPSILON);
        assert_eq!(metrics.native_calls().get("tdTurnOn"), Some(&2));
    }

    #[test]
    fn test_reset() {
        let metrics = BridgeMetrics::new();
        metrics.record_sync_call();
        metrics.record_callback_failure();
        metrics.reset();
        assert_eq!(metrics.snapshot(), BridgeStats::default());
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = BridgeMetrics::new();
        CallTimer::start("tdGetName").finish(&metrics);

        let output = metrics.to_prometheus();
        assert!(output.contains("telldus_bridge_calls_total{mode=\"async\"} 0"));
        assert!(output.contains("telldus_bridge_events_total{outcome=\"dropped\"} 0"));
        assert!(output.contains("function=\"tdGetName\"} 1"));
    }
}
