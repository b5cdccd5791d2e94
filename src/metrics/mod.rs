// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Arc;

use crate::messaging::ErrorReceiver;
use crate::storage::{EventStorageRecord, StorageError};

// Re-export for public API
pub use server::{start_metrics_server, Readiness};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers:
// - Hub: events published, records streamed to subscribers, evictions
// - Subscriber: handler executions and latency
// - Failures by operation, fed through MetricsErrorReceiver
// - Remote command executions
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the relay
pub struct Metrics {
    registry: Registry,

    // Hub Metrics
    pub events_published: IntCounterVec,
    pub events_delivered: IntCounterVec,
    pub subscribers_connected: IntGaugeVec,
    pub subscribers_evicted: IntCounterVec,

    // Subscriber Metrics
    pub events_handled: IntCounterVec,
    pub handler_duration: HistogramVec,

    // Failure Metrics
    pub relay_failures: IntCounterVec,

    // Command Metrics
    pub commands_executed: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Hub Metrics
        let events_published = IntCounterVec::new(
            Opts::new("relay_events_published_total", "Events accepted for broadcast"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_delivered = IntCounterVec::new(
            Opts::new("relay_events_delivered_total", "Records written to subscriber streams"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_delivered.clone()))?;

        let subscribers_connected = IntGaugeVec::new(
            Opts::new("relay_subscribers_connected", "Subscriber streams currently open"),
            &["event_type"],
        )?;
        registry.register(Box::new(subscribers_connected.clone()))?;

        let subscribers_evicted = IntCounterVec::new(
            Opts::new("relay_subscribers_evicted_total", "Subscribers removed after queue overflow"),
            &["event_type"],
        )?;
        registry.register(Box::new(subscribers_evicted.clone()))?;

        // Subscriber Metrics
        let events_handled = IntCounterVec::new(
            Opts::new("relay_events_handled_total", "Event handler executions"),
            &["event_type", "outcome"],
        )?;
        registry.register(Box::new(events_handled.clone()))?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new("relay_handler_duration_seconds", "Event handler duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["event_type"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        // Failure Metrics
        let relay_failures = IntCounterVec::new(
            Opts::new("relay_failures_total", "Failures reported by hub and subscriber loops"),
            &["event_type", "operation"],
        )?;
        registry.register(Box::new(relay_failures.clone()))?;

        // Command Metrics
        let commands_executed = IntCounterVec::new(
            Opts::new("relay_commands_executed_total", "Remote command executions"),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(commands_executed.clone()))?;

        Ok(Self {
            registry,
            events_published,
            events_delivered,
            subscribers_connected,
            subscribers_evicted,
            events_handled,
            handler_duration,
            relay_failures,
            commands_executed,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_published(&self, event_type: &str) {
        self.events_published.with_label_values(&[event_type]).inc();
    }

    pub fn record_delivered(&self, event_type: &str) {
        self.events_delivered.with_label_values(&[event_type]).inc();
    }

    pub fn subscriber_connected(&self, event_type: &str) {
        self.subscribers_connected.with_label_values(&[event_type]).inc();
    }

    pub fn subscriber_disconnected(&self, event_type: &str) {
        self.subscribers_connected.with_label_values(&[event_type]).dec();
    }

    pub fn record_eviction(&self, event_type: &str) {
        self.subscribers_evicted.with_label_values(&[event_type]).inc();
    }

    pub fn record_handled(&self, event_type: &str, duration_secs: f64, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.events_handled.with_label_values(&[event_type, outcome]).inc();
        self.handler_duration.with_label_values(&[event_type]).observe(duration_secs);
    }

    pub fn record_failure(&self, event_type: &str, operation: &str) {
        self.relay_failures.with_label_values(&[event_type, operation]).inc();
    }

    pub fn record_command(&self, command: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.commands_executed.with_label_values(&[command, outcome]).inc();
    }
}

// ============================================================================
// Error receiver that counts failures
// ============================================================================

pub struct MetricsErrorReceiver {
    metrics: Arc<Metrics>,
}

impl MetricsErrorReceiver {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl ErrorReceiver for MetricsErrorReceiver {
    fn on_store_failure(&self, event_type: &str, _records: &[EventStorageRecord], _attempt: u32, _error: &StorageError) {
        self.metrics.record_failure(event_type, "store");
    }

    fn on_retrieve_failure(&self, event_type: &str, _subscriber_id: &str, _attempt: u32, _error: &StorageError) {
        self.metrics.record_failure(event_type, "retrieve");
    }

    fn on_mark_complete_failure(&self, record: &EventStorageRecord, _attempt: u32, _error: &StorageError) {
        self.metrics.record_failure(&record.event_type, "mark_complete");
    }

    fn on_serialize_failure(&self, event_type: &str, _error: &serde_json::Error) {
        self.metrics.record_failure(event_type, "serialize");
    }

    fn on_overflow(&self, event_type: &str, _subscriber_id: &str) {
        self.metrics.record_eviction(event_type);
    }

    fn on_handler_failure(&self, record: &EventStorageRecord, _error: &anyhow::Error) {
        self.metrics.record_failure(&record.event_type, "handler");
    }

    fn on_restore_failure(&self, event_type: &str, _error: &anyhow::Error) {
        self.metrics.record_failure(event_type, "restore");
    }

    fn on_purge_failure(&self, _error: &StorageError) {
        self.metrics.record_failure("*", "purge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counter(metrics: &Metrics, name: &str) -> Vec<f64> {
        metrics
            .registry
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.metric.iter().filter_map(|s| s.counter.value).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_published("orders.Shipped");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_handled() {
        let metrics = Metrics::new().unwrap();
        metrics.record_handled("orders.Shipped", 0.05, true);
        metrics.record_handled("orders.Shipped", 0.05, false);
        metrics.record_handled("orders.Shipped", 0.05, true);

        let mut values = counter(&metrics, "relay_events_handled_total");
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_connected_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.subscriber_connected("orders.Shipped");
        metrics.subscriber_connected("orders.Shipped");
        metrics.subscriber_disconnected("orders.Shipped");

        let gathered = metrics.registry.gather();
        let gauge = gathered.iter().find(|m| m.name() == "relay_subscribers_connected").unwrap();
        assert_eq!(gauge.metric[0].gauge.value, Some(1.0));
    }

    #[test]
    fn test_error_receiver_counts_failures() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let receiver = MetricsErrorReceiver::new(metrics.clone());
        let record = EventStorageRecord::new("sub", "orders.Shipped", Vec::new(), Duration::from_secs(60));

        receiver.on_store_failure("orders.Shipped", &[record.clone()], 1, &StorageError::backend("down"));
        receiver.on_mark_complete_failure(&record, 2, &StorageError::backend("down"));
        receiver.on_overflow("orders.Shipped", "sub");

        assert_eq!(counter(&metrics, "relay_failures_total").len(), 2);
        assert_eq!(counter(&metrics, "relay_subscribers_evicted_total"), vec![1.0]);
    }
}
