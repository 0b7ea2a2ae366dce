//! Runs the watch and poll loops side by side over one shared cache

use super::{NodeObserver, PollConfig, PollLoop, WatchExit, WatchLoop};
use crate::health::{components, HealthRegistry};
use crate::source::ClusterNodeSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub poll: PollConfig,
    /// Wait before reopening a subscription that ended (default: 5 seconds)
    pub resubscribe_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            resubscribe_backoff: Duration::from_secs(5),
        }
    }
}

/// Composition of both observation channels
pub struct Reconciler {
    source: Arc<dyn ClusterNodeSource>,
    observer: NodeObserver,
    health: HealthRegistry,
    config: ReconcilerConfig,
}

/// Handles to the spawned loops
pub struct ReconcilerHandle {
    watch: JoinHandle<()>,
    poll: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Wait for both loops to stop
    pub async fn join(self) {
        let (watch, poll) = tokio::join!(self.watch, self.poll);
        if let Err(e) = watch {
            error!(error = %e, "Watch task failed");
        }
        if let Err(e) = poll {
            error!(error = %e, "Poll task failed");
        }
    }
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn ClusterNodeSource>,
        observer: NodeObserver,
        health: HealthRegistry,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            source,
            observer,
            health,
            config,
        }
    }

    /// Spawn both loops. Sending on `shutdown` stops them.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> ReconcilerHandle {
        let watch_shutdown = shutdown.subscribe();
        let poll_shutdown = shutdown.subscribe();

        let watch_loop = WatchLoop::new(
            self.source.clone(),
            self.observer.clone(),
            self.health.clone(),
        );
        let poll_loop = PollLoop::new(
            self.source,
            self.observer.clone(),
            self.health.clone(),
            self.config.poll,
        );

        let watch = tokio::spawn(supervise_watch(
            watch_loop,
            watch_shutdown,
            self.observer,
            self.health,
            self.config.resubscribe_backoff,
        ));
        let poll = tokio::spawn(async move { poll_loop.run(poll_shutdown).await });

        ReconcilerHandle { watch, poll }
    }
}

/// Keep a subscription open, reopening it after `backoff` whenever it ends
async fn supervise_watch(
    watch: WatchLoop,
    mut shutdown: broadcast::Receiver<()>,
    observer: NodeObserver,
    health: HealthRegistry,
    backoff: Duration,
) {
    loop {
        let reason = match watch.run(&mut shutdown).await {
            WatchExit::Shutdown => break,
            WatchExit::StreamEnded => "subscription stream closed".to_string(),
            WatchExit::StreamFailed(e) => e.to_string(),
        };

        observer.logger().log_watch_ended(&reason);
        health
            .set_degraded(components::WATCH, format!("resubscribing: {}", reason))
            .await;

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {
                observer.metrics().inc_watch_restarts();
                info!(backoff_ms = backoff.as_millis() as u64, "Resubscribing to node events");
            }
            _ = shutdown.recv() => break,
        }
    }
}
