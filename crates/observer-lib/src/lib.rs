//! Node observation library
//!
//! This crate provides the core functionality for:
//! - Deriving image storage and memory allocation metrics from node snapshots
//! - Change detection shared between a watch channel and a poll channel
//! - The Kubernetes node source
//! - Health checks and observability

pub mod cache;
pub mod error;
pub mod health;
pub mod kube_source;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod observer;
pub mod source;

pub use cache::{Change, ChangeCache};
pub use error::{ObserverError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use kube_source::KubeNodeSource;
pub use models::*;
pub use observability::{ObserverMetrics, StructuredLogger};
pub use observer::{NodeObserver, PollConfig, Reconciler, ReconcilerConfig};
pub use source::{ClusterNodeSource, NodeFilter};
