//! Core data models for the node observer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A cached container image on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub size_bytes: i64,
}

/// A node status condition, e.g. `MemoryPressure=True`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    pub type_: String,
    pub status: bool,
}

/// Transient snapshot of a cluster node
///
/// The cluster owns the authoritative copy; a snapshot is only valid for
/// the observation it was taken for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub images: Vec<ImageInfo>,
    pub allocatable_memory: Option<i64>,
    pub capacity_memory: Option<i64>,
    pub conditions: Vec<NodeCondition>,
    pub annotations: BTreeMap<String, String>,
    /// Version the snapshot was read at, used for optimistic updates
    pub resource_version: Option<String>,
}

impl NodeSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_images(mut self, sizes: impl IntoIterator<Item = i64>) -> Self {
        self.images = sizes
            .into_iter()
            .map(|size_bytes| ImageInfo { size_bytes })
            .collect();
        self
    }

    pub fn with_memory(mut self, capacity: i64, allocatable: i64) -> Self {
        self.capacity_memory = Some(capacity);
        self.allocatable_memory = Some(allocatable);
        self
    }

    pub fn with_condition(mut self, type_: impl Into<String>, status: bool) -> Self {
        self.conditions.push(NodeCondition {
            type_: type_.into(),
            status,
        });
        self
    }
}

/// Kind of change delivered by the event subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

/// A single notification from the event subscription
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub kind: EventKind,
    pub node: NodeSnapshot,
}

impl NodeEvent {
    pub fn added(node: NodeSnapshot) -> Self {
        Self {
            kind: EventKind::Added,
            node,
        }
    }

    pub fn updated(node: NodeSnapshot) -> Self {
        Self {
            kind: EventKind::Updated,
            node,
        }
    }

    pub fn deleted(node: NodeSnapshot) -> Self {
        Self {
            kind: EventKind::Deleted,
            node,
        }
    }
}

/// Which channel produced an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSource {
    Watch,
    Poll,
}

impl ObservationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationSource::Watch => "watch",
            ObservationSource::Poll => "poll",
        }
    }
}

impl fmt::Display for ObservationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics derived from one node snapshot. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub image_storage_bytes: i64,
    pub allocated_memory_percent: f64,
    pub under_memory_pressure: bool,
}
