//! Boundary to the cluster control plane

use crate::error::Result;
use crate::models::{NodeEvent, NodeSnapshot};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Which nodes a listing should return
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeFilter {
    #[default]
    All,
    Name(String),
}

impl NodeFilter {
    /// Build a filter from an optional node name
    pub fn from_name(name: Option<String>) -> Self {
        match name {
            Some(name) if !name.is_empty() => NodeFilter::Name(name),
            _ => NodeFilter::All,
        }
    }

    pub fn matches(&self, node: &NodeSnapshot) -> bool {
        match self {
            NodeFilter::All => true,
            NodeFilter::Name(name) => node.name == *name,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, NodeFilter::All)
    }
}

/// Stream of node notifications from one subscription
pub type NodeEventStream = BoxStream<'static, Result<NodeEvent>>;

/// Source of node snapshots and change notifications
#[async_trait]
pub trait ClusterNodeSource: Send + Sync {
    /// List the nodes matching `filter`
    async fn list(&self, filter: &NodeFilter) -> Result<Vec<NodeSnapshot>>;

    /// Open a new subscription. Calling again after a failure restarts it.
    fn subscribe(&self) -> NodeEventStream;

    /// Write the node's annotations back to the cluster
    async fn update(&self, node: &NodeSnapshot) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_filter_from_name() {
        assert_eq!(NodeFilter::from_name(None), NodeFilter::All);
        assert_eq!(NodeFilter::from_name(Some(String::new())), NodeFilter::All);
        assert_eq!(
            NodeFilter::from_name(Some("minikube".to_string())),
            NodeFilter::Name("minikube".to_string())
        );
    }

    #[test]
    fn test_node_filter_matches() {
        let node = NodeSnapshot::new("minikube");
        assert!(NodeFilter::All.matches(&node));
        assert!(NodeFilter::Name("minikube".to_string()).matches(&node));
        assert!(!NodeFilter::Name("other".to_string()).matches(&node));
    }
}
