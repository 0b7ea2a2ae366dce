//! Push channel: reacts to node notifications from the event subscription

use super::{NodeObserver, Observation};
use crate::error::ObserverError;
use crate::health::{components, HealthRegistry};
use crate::models::{EventKind, NodeEvent, ObservationSource};
use crate::source::ClusterNodeSource;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Why a watch loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchExit {
    Shutdown,
    /// The subscription stream finished
    StreamEnded,
    /// The subscription stream yielded a transport failure
    StreamFailed(ObserverError),
}

/// Consumes one subscription at a time
pub struct WatchLoop {
    source: Arc<dyn ClusterNodeSource>,
    observer: NodeObserver,
    health: HealthRegistry,
}

impl WatchLoop {
    pub fn new(
        source: Arc<dyn ClusterNodeSource>,
        observer: NodeObserver,
        health: HealthRegistry,
    ) -> Self {
        Self {
            source,
            observer,
            health,
        }
    }

    /// Subscribe and process events until the stream ends or shutdown is
    /// signalled. Failures on single events never end the loop.
    pub async fn run(&self, shutdown: &mut broadcast::Receiver<()>) -> WatchExit {
        let mut events = self.source.subscribe();
        info!("Subscribed to node events");
        let mut receiving = false;

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(Ok(event)) => {
                            // Healthy once the subscription delivers
                            if !receiving {
                                receiving = true;
                                self.health.set_healthy(components::WATCH).await;
                            }
                            self.handle_event(event);
                        }
                        Some(Err(e @ ObserverError::Computation { .. })) => {
                            warn!(error = %e, "Skipping unreadable node event");
                            self.observer.metrics().inc_computation_errors();
                        }
                        Some(Err(e)) => {
                            return WatchExit::StreamFailed(e);
                        }
                        None => {
                            return WatchExit::StreamEnded;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down node watch loop");
                    return WatchExit::Shutdown;
                }
            }
        }
    }

    /// Process one notification
    pub fn handle_event(&self, event: NodeEvent) -> Option<Observation> {
        match event.kind {
            EventKind::Added | EventKind::Updated => {
                debug!(node = %event.node.name, kind = ?event.kind, "Node event received");
                match self.observer.observe(&event.node, ObservationSource::Watch) {
                    Ok(observation) => Some(observation),
                    // Logged and counted by the observer
                    Err(_) => None,
                }
            }
            EventKind::Deleted => {
                self.observer.forget(&event.node.name);
                None
            }
        }
    }
}
