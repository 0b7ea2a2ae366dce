//! Observability infrastructure for the node observer
//!
//! Provides:
//! - Prometheus metrics (observations, changes, error counters, per-node gauges)
//! - Structured JSON logging with tracing

use crate::error::ObserverError;
use crate::metrics::format_bytes;
use crate::models::ObservationSource;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

/// Histogram buckets for poll tick latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ObserverMetricsInner> = OnceLock::new();

struct ObserverMetricsInner {
    observations: IntCounterVec,
    storage_changes: IntCounter,
    list_errors: IntCounter,
    update_errors: IntCounter,
    computation_errors: IntCounter,
    watch_restarts: IntCounter,
    image_storage_bytes: IntGaugeVec,
    allocated_memory_percent: GaugeVec,
    memory_pressure: IntGaugeVec,
    cache_entries: IntGauge,
    poll_latency_seconds: Histogram,
}

impl ObserverMetricsInner {
    fn new() -> Self {
        Self {
            observations: register_int_counter_vec!(
                "node_observer_observations_total",
                "Node observations processed, by channel",
                &["source"]
            )
            .expect("Failed to register observations_total"),

            storage_changes: register_int_counter!(
                "node_observer_storage_changes_total",
                "Image storage changes reported"
            )
            .expect("Failed to register storage_changes_total"),

            list_errors: register_int_counter!(
                "node_observer_list_errors_total",
                "Failed node listings"
            )
            .expect("Failed to register list_errors_total"),

            update_errors: register_int_counter!(
                "node_observer_update_errors_total",
                "Failed node annotation updates"
            )
            .expect("Failed to register update_errors_total"),

            computation_errors: register_int_counter!(
                "node_observer_computation_errors_total",
                "Node snapshots skipped because metrics could not be derived"
            )
            .expect("Failed to register computation_errors_total"),

            watch_restarts: register_int_counter!(
                "node_observer_watch_restarts_total",
                "Times the node event subscription was reopened"
            )
            .expect("Failed to register watch_restarts_total"),

            image_storage_bytes: register_int_gauge_vec!(
                "node_observer_image_storage_bytes",
                "Bytes occupied by cached container images",
                &["node"]
            )
            .expect("Failed to register image_storage_bytes"),

            allocated_memory_percent: register_gauge_vec!(
                "node_observer_allocated_memory_percent",
                "Percentage of memory capacity that is not allocatable",
                &["node"]
            )
            .expect("Failed to register allocated_memory_percent"),

            memory_pressure: register_int_gauge_vec!(
                "node_observer_memory_pressure",
                "1 when the node reports MemoryPressure",
                &["node"]
            )
            .expect("Failed to register memory_pressure"),

            cache_entries: register_int_gauge!(
                "node_observer_cache_entries",
                "Nodes tracked by the change cache"
            )
            .expect("Failed to register cache_entries"),

            poll_latency_seconds: register_histogram!(
                "node_observer_poll_latency_seconds",
                "Time spent on one poll tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),
        }
    }
}

/// Observer metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct ObserverMetrics {
    _private: (),
}

impl Default for ObserverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ObserverMetricsInner {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new)
    }

    pub fn inc_observations(&self, source: ObservationSource) {
        self.inner()
            .observations
            .with_label_values(&[source.as_str()])
            .inc();
    }

    pub fn inc_storage_changes(&self) {
        self.inner().storage_changes.inc();
    }

    pub fn inc_list_errors(&self) {
        self.inner().list_errors.inc();
    }

    pub fn inc_update_errors(&self) {
        self.inner().update_errors.inc();
    }

    pub fn inc_computation_errors(&self) {
        self.inner().computation_errors.inc();
    }

    pub fn inc_watch_restarts(&self) {
        self.inner().watch_restarts.inc();
    }

    pub fn set_image_storage(&self, node: &str, bytes: i64) {
        self.inner()
            .image_storage_bytes
            .with_label_values(&[node])
            .set(bytes);
    }

    pub fn set_allocated_memory(&self, node: &str, percent: f64) {
        self.inner()
            .allocated_memory_percent
            .with_label_values(&[node])
            .set(percent);
    }

    pub fn set_memory_pressure(&self, node: &str, under_pressure: bool) {
        self.inner()
            .memory_pressure
            .with_label_values(&[node])
            .set(i64::from(under_pressure));
    }

    /// Drop every per-node series for a node that left the fleet
    pub fn forget_node(&self, node: &str) {
        let inner = self.inner();
        let _ = inner.image_storage_bytes.remove_label_values(&[node]);
        let _ = inner.allocated_memory_percent.remove_label_values(&[node]);
        let _ = inner.memory_pressure.remove_label_values(&[node]);
    }

    pub fn set_cache_entries(&self, count: usize) {
        self.inner().cache_entries.set(count as i64);
    }

    pub fn observe_poll_latency(&self, duration_secs: f64) {
        self.inner().poll_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for observation events
///
/// Every event carries an `event` field so log pipelines can route on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_node_observed(&self, name: &str, source: ObservationSource) {
        debug!(
            event = "node_observed",
            instance = %self.instance,
            node = %name,
            source = %source,
            "Node [{}] observed via {}; checking resources", name, source
        );
    }

    pub fn log_storage_changed(&self, name: &str, old_bytes: i64, new_bytes: i64) {
        info!(
            event = "storage_changed",
            instance = %self.instance,
            node = %name,
            old_bytes = old_bytes,
            new_bytes = new_bytes,
            "Node [{}] has [{}] occupied by images (was {})",
            name,
            format_bytes(new_bytes),
            format_bytes(old_bytes)
        );
    }

    pub fn log_storage_unchanged(&self, name: &str) {
        debug!(
            event = "storage_unchanged",
            instance = %self.instance,
            node = %name,
            "Node [{}] image storage unchanged", name
        );
    }

    pub fn log_allocated_capacity(&self, name: &str, percent: f64) {
        info!(
            event = "allocated_capacity",
            instance = %self.instance,
            node = %name,
            percent = percent,
            "Node [{}] has {:.2}% of memory allocated", name, percent
        );
    }

    pub fn log_memory_pressure(&self, name: &str, under_pressure: bool) {
        if under_pressure {
            warn!(
                event = "memory_pressure",
                instance = %self.instance,
                node = %name,
                under_pressure = true,
                "Node [{}] is under memory pressure", name
            );
        } else {
            debug!(
                event = "memory_pressure",
                instance = %self.instance,
                node = %name,
                under_pressure = false,
                "Node [{}] has no memory pressure", name
            );
        }
    }

    pub fn log_list_failed(&self, err: &ObserverError) {
        error!(
            event = "node_list_failed",
            instance = %self.instance,
            error_kind = err.kind(),
            error = %err,
            "Failed to list nodes; abandoning poll tick"
        );
    }

    pub fn log_update_failed(&self, name: &str, err: &ObserverError) {
        warn!(
            event = "node_update_failed",
            instance = %self.instance,
            node = %name,
            error_kind = err.kind(),
            error = %err,
            "Failed to mark node as checked"
        );
    }

    pub fn log_computation_failed(&self, name: &str, source: ObservationSource, err: &ObserverError) {
        warn!(
            event = "node_computation_failed",
            instance = %self.instance,
            node = %name,
            source = %source,
            error = %err,
            "Skipping node; metrics could not be derived"
        );
    }

    pub fn log_watch_ended(&self, reason: &str) {
        warn!(
            event = "watch_stream_ended",
            instance = %self.instance,
            reason = %reason,
            "Node event subscription ended"
        );
    }

    pub fn log_node_evicted(&self, name: &str) {
        info!(
            event = "node_evicted",
            instance = %self.instance,
            node = %name,
            "Node [{}] left the fleet; dropped from change cache", name
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "observer_started",
            instance = %self.instance,
            version = %version,
            "Node observer started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "observer_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Node observer shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_metrics_handle() {
        let metrics = ObserverMetrics::new();

        metrics.inc_observations(ObservationSource::Watch);
        metrics.inc_observations(ObservationSource::Poll);
        metrics.inc_storage_changes();
        metrics.set_image_storage("metrics-test-node", 500_000_000);
        metrics.set_allocated_memory("metrics-test-node", 25.0);
        metrics.set_memory_pressure("metrics-test-node", true);
        metrics.set_cache_entries(1);
        metrics.observe_poll_latency(0.01);
        metrics.forget_node("metrics-test-node");

        // Clones share the registered metrics
        let clone = metrics.clone();
        clone.inc_list_errors();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-observer");
        assert_eq!(logger.instance, "test-observer");
    }
}
