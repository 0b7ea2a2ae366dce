//! Pull channel: periodic full reconciliation of the node list
//!
//! Each tick lists nodes, marks the designated node as checked, and observes
//! every listed node through the shared change cache.

use super::NodeObserver;
use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::models::ObservationSource;
use crate::source::{ClusterNodeSource, NodeFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Annotation written to the designated node on every tick
pub const CHECKED_ANNOTATION: &str = "checked";

/// Configuration for the poll loop
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Time between ticks (default: 5 seconds)
    pub interval: Duration,
    /// Which nodes each tick lists
    pub filter: NodeFilter,
    /// Node to annotate as checked, if any
    pub target_node: Option<String>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            filter: NodeFilter::All,
            target_node: None,
        }
    }
}

impl PollConfig {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn filter(mut self, filter: NodeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn target_node(mut self, name: impl Into<String>) -> Self {
        self.target_node = Some(name.into());
        self
    }
}

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub listed: usize,
    pub changed: usize,
    /// Nodes skipped because their metrics could not be derived
    pub failures: usize,
    pub evicted: usize,
    /// Whether the designated node was annotated this tick
    pub marked: bool,
}

pub struct PollLoop {
    source: Arc<dyn ClusterNodeSource>,
    observer: NodeObserver,
    health: HealthRegistry,
    config: PollConfig,
}

impl PollLoop {
    pub fn new(
        source: Arc<dyn ClusterNodeSource>,
        observer: NodeObserver,
        health: HealthRegistry,
        config: PollConfig,
    ) -> Self {
        Self {
            source,
            observer,
            health,
            config,
        }
    }

    /// Tick until shutdown. A failed tick never stops the loop.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            filter = ?self.config.filter,
            target_node = ?self.config.target_node,
            "Starting node poll loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    // Errors are logged inside the tick; the next tick retries.
                    if let Ok(report) = self.run_tick().await {
                        debug!(
                            listed = report.listed,
                            changed = report.changed,
                            failures = report.failures,
                            evicted = report.evicted,
                            marked = report.marked,
                            "Poll tick complete"
                        );
                    }
                    self.observer
                        .metrics()
                        .observe_poll_latency(start.elapsed().as_secs_f64());
                }
                _ = shutdown.recv() => {
                    info!("Shutting down node poll loop");
                    break;
                }
            }
        }
    }

    /// Run a single tick
    ///
    /// Returns the listing error when the tick had to be abandoned.
    pub async fn run_tick(&self) -> Result<TickReport> {
        let listed_at = std::time::Instant::now();
        let mut nodes = match self.source.list(&self.config.filter).await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.observer.logger().log_list_failed(&e);
                self.observer.metrics().inc_list_errors();
                self.health
                    .set_degraded(components::POLL, format!("node listing failed: {}", e))
                    .await;
                return Err(e);
            }
        };
        self.health.set_healthy(components::POLL).await;

        let mut report = TickReport {
            listed: nodes.len(),
            ..Default::default()
        };

        if let Some(target) = &self.config.target_node {
            if let Some(node) = nodes.iter_mut().find(|n| n.name == *target) {
                let mut marked = node.clone();
                marked
                    .annotations
                    .insert(CHECKED_ANNOTATION.to_string(), "true".to_string());

                match self.source.update(&marked).await {
                    Ok(()) => {
                        debug!(node = %target, "Marked node as checked");
                        *node = marked;
                        report.marked = true;
                    }
                    Err(e) => {
                        self.observer.logger().log_update_failed(target, &e);
                        self.observer.metrics().inc_update_errors();
                    }
                }
            }
        }

        for node in &nodes {
            match self.observer.observe(node, ObservationSource::Poll) {
                Ok(observation) if observation.change.changed => report.changed += 1,
                Ok(_) => {}
                Err(_) => report.failures += 1,
            }
        }

        // Only a complete listing says which nodes are gone. Nodes observed
        // after the listing started are kept.
        if self.config.filter.is_all() {
            report.evicted = self
                .observer
                .retain_only(nodes.iter().map(|n| n.name.as_str()), listed_at);
        }

        Ok(report)
    }
}
