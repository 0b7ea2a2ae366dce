//! Observer configuration

use anyhow::Result;
use observer_lib::{NodeFilter, PollConfig, ReconcilerConfig};
use serde::Deserialize;
use std::time::Duration;

/// Observer configuration, read from `OBSERVER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    /// Name this observer logs under
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between full node listings
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Restrict listings to one node; unset lists every node
    #[serde(default)]
    pub poll_node_filter: Option<String>,

    /// Node to annotate as checked on every poll
    #[serde(default)]
    pub target_node: Option<String>,

    /// Seconds to wait before reopening a closed node subscription
    #[serde(default = "default_resubscribe_backoff")]
    pub resubscribe_backoff_secs: u64,
}

fn default_instance_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "node-observer".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    5
}

fn default_resubscribe_backoff() -> u64 {
    5
}

impl ObserverConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("OBSERVER").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        let mut poll = PollConfig::default()
            .interval(Duration::from_secs(self.poll_interval_secs.max(1)))
            .filter(NodeFilter::from_name(self.poll_node_filter.clone()));
        if let Some(target) = self.target_node.as_deref().filter(|t| !t.is_empty()) {
            poll = poll.target_node(target);
        }

        ReconcilerConfig {
            poll,
            resubscribe_backoff: Duration::from_secs(self.resubscribe_backoff_secs),
        }
    }
}
