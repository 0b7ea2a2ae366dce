//! Kubernetes implementation of [`ClusterNodeSource`]
//!
//! Lists and patches `v1/Node` objects through the API server and turns the
//! kube-runtime watcher into a stream of add/update/delete notifications.

use crate::error::{ObserverError, Result};
use crate::models::{ImageInfo, NodeCondition, NodeEvent, NodeSnapshot};
use crate::source::{ClusterNodeSource, NodeEventStream, NodeFilter};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::watcher;
use kube::Client;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

const MEMORY: &str = "memory";

/// Node source backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeNodeSource {
    api: Api<Node>,
}

impl KubeNodeSource {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ClusterNodeSource for KubeNodeSource {
    async fn list(&self, filter: &NodeFilter) -> Result<Vec<NodeSnapshot>> {
        let params = match filter {
            NodeFilter::All => ListParams::default(),
            NodeFilter::Name(name) => {
                ListParams::default().fields(&format!("metadata.name={}", name))
            }
        };

        let nodes = self
            .api
            .list(&params)
            .await
            .map_err(|e| ObserverError::Transport(e.to_string()))?;

        let snapshots = nodes
            .items
            .iter()
            .filter_map(|node| match snapshot_from_node(node) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable node in listing");
                    None
                }
            })
            .collect();

        Ok(snapshots)
    }

    fn subscribe(&self) -> NodeEventStream {
        let mut known = HashSet::new();

        watcher::watcher(self.api.clone(), watcher::Config::default())
            .map(move |event| match event {
                Ok(event) => classify_event(&mut known, event),
                Err(e) => vec![Err(ObserverError::Transport(e.to_string()))],
            })
            .flat_map(stream::iter)
            .boxed()
    }

    async fn update(&self, node: &NodeSnapshot) -> Result<()> {
        let patch = annotations_patch(node);

        self.api
            .patch(&node.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| update_error(&node.name, e))?;

        debug!(node = %node.name, "Patched node annotations");
        Ok(())
    }
}

/// Merge patch writing the snapshot's annotations
///
/// Carries the snapshot's resource version when known, so the API server
/// rejects the write if the node changed since it was listed.
fn annotations_patch(node: &NodeSnapshot) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "annotations": node.annotations });
    if let Some(version) = &node.resource_version {
        metadata["resourceVersion"] = serde_json::Value::String(version.clone());
    }
    serde_json::json!({ "metadata": metadata })
}

fn update_error(name: &str, err: kube::Error) -> ObserverError {
    match err {
        kube::Error::Api(response) if response.code == 409 => ObserverError::Conflict {
            name: name.to_string(),
        },
        other => ObserverError::Transport(other.to_string()),
    }
}

/// Turn one watcher event into node notifications
///
/// `known` holds the names seen on this subscription so that the first
/// `Applied` for a node reads as an addition.
fn classify_event(
    known: &mut HashSet<String>,
    event: watcher::Event<Node>,
) -> Vec<Result<NodeEvent>> {
    match event {
        watcher::Event::Applied(node) => vec![snapshot_from_node(&node).map(|snapshot| {
            if known.insert(snapshot.name.clone()) {
                NodeEvent::added(snapshot)
            } else {
                NodeEvent::updated(snapshot)
            }
        })],
        watcher::Event::Deleted(node) => vec![snapshot_from_node(&node).map(|snapshot| {
            known.remove(&snapshot.name);
            NodeEvent::deleted(snapshot)
        })],
        watcher::Event::Restarted(nodes) => {
            known.clear();
            nodes
                .iter()
                .map(|node| {
                    snapshot_from_node(node).map(|snapshot| {
                        known.insert(snapshot.name.clone());
                        NodeEvent::added(snapshot)
                    })
                })
                .collect()
        }
    }
}

/// Build a snapshot from an API object
pub fn snapshot_from_node(node: &Node) -> Result<NodeSnapshot> {
    let name = node
        .metadata
        .name
        .clone()
        .ok_or_else(|| ObserverError::computation("<unnamed>", "node has no name"))?;

    let mut snapshot = NodeSnapshot::new(name);
    snapshot.annotations = node.metadata.annotations.clone().unwrap_or_default();
    snapshot.resource_version = node.metadata.resource_version.clone();

    if let Some(status) = &node.status {
        snapshot.images = status
            .images
            .iter()
            .flatten()
            .map(|image| ImageInfo {
                size_bytes: image.size_bytes.unwrap_or(0),
            })
            .collect();
        snapshot.capacity_memory = memory_bytes(status.capacity.as_ref());
        snapshot.allocatable_memory = memory_bytes(status.allocatable.as_ref());
        snapshot.conditions = status
            .conditions
            .iter()
            .flatten()
            .map(|c| NodeCondition {
                type_: c.type_.clone(),
                status: c.status == "True",
            })
            .collect();
    }

    Ok(snapshot)
}

fn memory_bytes(resources: Option<&BTreeMap<String, Quantity>>) -> Option<i64> {
    let quantity = resources?.get(MEMORY)?;
    let bytes = parse_quantity_bytes(&quantity.0);
    if bytes.is_none() {
        warn!(quantity = %quantity.0, "Unparseable memory quantity");
    }
    bytes
}

/// Parse a Kubernetes quantity (`8Gi`, `8000000Ki`, `8G`, `8e9`, `1.5Mi`)
/// into whole bytes, rounding fractions up
pub fn parse_quantity_bytes(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let (mantissa, mut divisor) = parse_decimal(number)?;

    let mut factor: i128 = 1;
    match suffix {
        "" => {}
        "Ki" => factor = 1 << 10,
        "Mi" => factor = 1 << 20,
        "Gi" => factor = 1 << 30,
        "Ti" => factor = 1 << 40,
        "Pi" => factor = 1 << 50,
        "Ei" => factor = 1 << 60,
        "k" => factor = 1_000,
        "M" => factor = 1_000_000,
        "G" => factor = 1_000_000_000,
        "T" => factor = 1_000_000_000_000,
        "P" => factor = 1_000_000_000_000_000,
        "E" => factor = 1_000_000_000_000_000_000,
        "m" => divisor *= 1_000,
        "u" => divisor *= 1_000_000,
        "n" => divisor *= 1_000_000_000,
        exponent => {
            let exponent: i32 = exponent
                .strip_prefix('e')
                .or_else(|| exponent.strip_prefix('E'))?
                .parse()
                .ok()?;
            let power = 10i128.checked_pow(exponent.unsigned_abs())?;
            if exponent >= 0 {
                factor = power;
            } else {
                divisor = divisor.checked_mul(power)?;
            }
        }
    }

    let scaled = mantissa.checked_mul(factor)?;
    let bytes = (scaled + divisor - 1) / divisor;
    i64::try_from(bytes).ok()
}

/// Parse a non-negative decimal into `(mantissa, divisor)`
fn parse_decimal(number: &str) -> Option<(i128, i128)> {
    let number = number.strip_prefix('+').unwrap_or(number);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let digits = format!("{}{}", whole, fraction);
    let mantissa: i128 = digits.parse().ok()?;
    let divisor = 10i128.checked_pow(fraction.len() as u32)?;
    Some((mantissa, divisor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerImage, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn api_node(name: &str, images: &[i64], capacity: &str, allocatable: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("42".to_string()),
                annotations: Some(BTreeMap::from([(
                    "team".to_string(),
                    "infra".to_string(),
                )])),
                ..Default::default()
            },
            status: Some(NodeStatus {
                images: Some(
                    images
                        .iter()
                        .map(|size| ContainerImage {
                            names: Some(vec!["registry/image:tag".to_string()]),
                            size_bytes: Some(*size),
                        })
                        .collect(),
                ),
                capacity: Some(BTreeMap::from([(
                    MEMORY.to_string(),
                    Quantity(capacity.to_string()),
                )])),
                allocatable: Some(BTreeMap::from([(
                    MEMORY.to_string(),
                    Quantity(allocatable.to_string()),
                )])),
                conditions: Some(vec![k8s_openapi::api::core::v1::NodeCondition {
                    type_: "MemoryPressure".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_quantity_binary_suffixes() {
        assert_eq!(parse_quantity_bytes("8Gi"), Some(8 * 1024 * 1024 * 1024));
        assert_eq!(parse_quantity_bytes("8000000Ki"), Some(8_192_000_000));
        assert_eq!(parse_quantity_bytes("1.5Mi"), Some(1_572_864));
    }

    #[test]
    fn test_parse_quantity_decimal_suffixes() {
        assert_eq!(parse_quantity_bytes("8G"), Some(8_000_000_000));
        assert_eq!(parse_quantity_bytes("500M"), Some(500_000_000));
        assert_eq!(parse_quantity_bytes("12k"), Some(12_000));
        assert_eq!(parse_quantity_bytes("123456"), Some(123_456));
        assert_eq!(parse_quantity_bytes("1500m"), Some(2));
    }

    #[test]
    fn test_parse_quantity_exponent() {
        assert_eq!(parse_quantity_bytes("8e9"), Some(8_000_000_000));
        assert_eq!(parse_quantity_bytes("8E3"), Some(8_000));
        assert_eq!(parse_quantity_bytes("1E"), Some(1_000_000_000_000_000_000));
    }

    #[test]
    fn test_parse_quantity_invalid() {
        assert_eq!(parse_quantity_bytes(""), None);
        assert_eq!(parse_quantity_bytes("Gi"), None);
        assert_eq!(parse_quantity_bytes("12Xi"), None);
        assert_eq!(parse_quantity_bytes("-5Gi"), None);
        assert_eq!(parse_quantity_bytes("1.2.3"), None);
    }

    #[test]
    fn test_snapshot_from_node() {
        let node = api_node("alpha", &[200_000_000, 300_000_000], "8G", "6G");
        let snapshot = snapshot_from_node(&node).unwrap();

        assert_eq!(snapshot.name, "alpha");
        assert_eq!(crate::metrics::image_storage_bytes(&snapshot), 500_000_000);
        assert_eq!(snapshot.capacity_memory, Some(8_000_000_000));
        assert_eq!(snapshot.allocatable_memory, Some(6_000_000_000));
        assert_eq!(snapshot.resource_version.as_deref(), Some("42"));
        assert_eq!(snapshot.annotations.get("team").map(String::as_str), Some("infra"));
        assert!(crate::metrics::under_memory_pressure(&snapshot));
    }

    #[test]
    fn test_snapshot_from_node_without_status() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let snapshot = snapshot_from_node(&node).unwrap();
        assert!(snapshot.images.is_empty());
        assert_eq!(snapshot.capacity_memory, None);
    }

    #[test]
    fn test_snapshot_from_unnamed_node() {
        assert!(snapshot_from_node(&Node::default()).is_err());
    }

    #[test]
    fn test_classify_event_added_then_updated() {
        let mut known = HashSet::new();
        let node = api_node("alpha", &[1], "8G", "6G");

        let first = classify_event(&mut known, watcher::Event::Applied(node.clone()));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap().kind, crate::models::EventKind::Added);

        let second = classify_event(&mut known, watcher::Event::Applied(node.clone()));
        assert_eq!(second[0].as_ref().unwrap().kind, crate::models::EventKind::Updated);

        let deleted = classify_event(&mut known, watcher::Event::Deleted(node.clone()));
        assert_eq!(deleted[0].as_ref().unwrap().kind, crate::models::EventKind::Deleted);
        assert!(known.is_empty());

        let again = classify_event(&mut known, watcher::Event::Applied(node));
        assert_eq!(again[0].as_ref().unwrap().kind, crate::models::EventKind::Added);
    }

    #[test]
    fn test_classify_event_restarted() {
        let mut known = HashSet::from(["stale".to_string()]);
        let nodes = vec![
            api_node("alpha", &[1], "8G", "6G"),
            api_node("beta", &[2], "8G", "6G"),
        ];

        let events = classify_event(&mut known, watcher::Event::Restarted(nodes));
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.as_ref().unwrap().kind == crate::models::EventKind::Added));
        assert!(!known.contains("stale"));
        assert!(known.contains("alpha"));
    }

    #[test]
    fn test_annotations_patch_carries_version_and_mark() {
        let mut snapshot = snapshot_from_node(&api_node("alpha", &[1], "8G", "6G")).unwrap();
        snapshot
            .annotations
            .insert(crate::observer::CHECKED_ANNOTATION.to_string(), "true".to_string());

        let patch = annotations_patch(&snapshot);

        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["metadata"]["annotations"]["checked"], "true");
        assert_eq!(patch["metadata"]["annotations"]["team"], "infra");
    }

    #[test]
    fn test_annotations_patch_without_version() {
        let snapshot = NodeSnapshot::new("alpha");
        let patch = annotations_patch(&snapshot);

        assert!(patch["metadata"].get("resourceVersion").is_none());
        assert_eq!(patch["metadata"]["annotations"], serde_json::json!({}));
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("nodes \"alpha\": {}", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_update_error_conflict() {
        assert_eq!(
            update_error("alpha", api_error(409, "Conflict")),
            ObserverError::Conflict {
                name: "alpha".to_string()
            }
        );
    }

    #[test]
    fn test_update_error_other_status_is_transport() {
        for (code, reason) in [(404, "NotFound"), (500, "InternalError")] {
            let err = update_error("alpha", api_error(code, reason));
            assert!(matches!(err, ObserverError::Transport(_)), "{:?}", err);
        }
    }
}
