//! Dual-channel node observation
//!
//! A watch loop reacts to node notifications while a poll loop periodically
//! lists every node. Both feed the same [`NodeObserver`], whose change cache
//! decides which observations are worth reporting.

mod poll;
mod reconciler;
mod watch;


pub use poll::{PollConfig, PollLoop, TickReport, CHECKED_ANNOTATION};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerHandle};
pub use watch::{WatchExit, WatchLoop};

use crate::cache::{Change, ChangeCache};
use crate::error::Result;
use crate::metrics;
use crate::models::{NodeSnapshot, ObservationSource};
use crate::observability::{ObserverMetrics, StructuredLogger};
use std::time::Instant;

/// Result of observing one node snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub change: Change,
    pub image_storage_bytes: i64,
    pub allocated_memory_percent: f64,
    pub under_memory_pressure: bool,
}

/// Observation step shared by both loops
#[derive(Clone)]
pub struct NodeObserver {
    cache: ChangeCache,
    logger: StructuredLogger,
    metrics: ObserverMetrics,
}

impl NodeObserver {
    pub fn new(cache: ChangeCache, logger: StructuredLogger, metrics: ObserverMetrics) -> Self {
        Self {
            cache,
            logger,
            metrics,
        }
    }

    pub fn cache(&self) -> &ChangeCache {
        &self.cache
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn metrics(&self) -> &ObserverMetrics {
        &self.metrics
    }

    /// Derive a node's metrics and report what changed
    ///
    /// The storage baseline is recorded before the memory metrics are
    /// derived, so a node with malformed memory fields still takes part in
    /// change detection. The computation error is logged here.
    pub fn observe(&self, node: &NodeSnapshot, source: ObservationSource) -> Result<Observation> {
        self.logger.log_node_observed(&node.name, source);
        self.metrics.inc_observations(source);

        let image_storage_bytes = metrics::image_storage_bytes(node);
        let change = self.cache.record_and_compare(&node.name, image_storage_bytes);
        if change.changed {
            self.logger
                .log_storage_changed(&node.name, change.old_bytes, image_storage_bytes);
            self.metrics.inc_storage_changes();
        } else {
            self.logger.log_storage_unchanged(&node.name);
        }
        self.metrics.set_image_storage(&node.name, image_storage_bytes);
        self.metrics.set_cache_entries(self.cache.len());

        let allocated_memory_percent = match metrics::allocated_memory_percent(node) {
            Ok(percent) => percent,
            Err(e) => {
                self.logger.log_computation_failed(&node.name, source, &e);
                self.metrics.inc_computation_errors();
                return Err(e);
            }
        };
        self.logger
            .log_allocated_capacity(&node.name, allocated_memory_percent);
        self.metrics
            .set_allocated_memory(&node.name, allocated_memory_percent);

        let under_memory_pressure = metrics::under_memory_pressure(node);
        self.logger
            .log_memory_pressure(&node.name, under_memory_pressure);
        self.metrics
            .set_memory_pressure(&node.name, under_memory_pressure);

        Ok(Observation {
            name: node.name.clone(),
            change,
            image_storage_bytes,
            allocated_memory_percent,
            under_memory_pressure,
        })
    }

    /// Forget a node that left the fleet
    pub fn forget(&self, name: &str) -> bool {
        let removed = self.cache.evict(name).is_some();
        if removed {
            self.logger.log_node_evicted(name);
        }
        self.metrics.forget_node(name);
        self.metrics.set_cache_entries(self.cache.len());
        removed
    }

    /// Forget every node not named in a complete listing taken at `listed_at`
    pub fn retain_only<'a>(
        &self,
        live: impl IntoIterator<Item = &'a str>,
        listed_at: Instant,
    ) -> usize {
        let evicted = self.cache.retain_only(live, listed_at);
        for name in &evicted {
            self.logger.log_node_evicted(name);
            self.metrics.forget_node(name);
        }
        self.metrics.set_cache_entries(self.cache.len());
        evicted.len()
    }
}
