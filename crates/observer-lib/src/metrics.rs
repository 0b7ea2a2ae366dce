//! Per-node metric derivation
//!
//! Pure functions over a [`NodeSnapshot`]: disk space held by cached images,
//! share of memory capacity already committed, and memory pressure.

use crate::error::{ObserverError, Result};
use crate::models::{DerivedMetrics, NodeSnapshot};

/// Condition type reported by the kubelet when a node runs low on memory
pub const MEMORY_PRESSURE: &str = "MemoryPressure";

/// Total bytes occupied by cached container images on the node
pub fn image_storage_bytes(node: &NodeSnapshot) -> i64 {
    node.images
        .iter()
        .fold(0i64, |total, image| total.saturating_add(image.size_bytes))
}

/// Percentage of memory capacity that is not allocatable, rounded half-up
/// to two decimal places
pub fn allocated_memory_percent(node: &NodeSnapshot) -> Result<f64> {
    let capacity = node
        .capacity_memory
        .ok_or_else(|| ObserverError::computation(&node.name, "memory capacity missing"))?;
    let allocatable = node
        .allocatable_memory
        .ok_or_else(|| ObserverError::computation(&node.name, "allocatable memory missing"))?;

    if capacity <= 0 {
        return Err(ObserverError::computation(
            &node.name,
            format!("memory capacity must be positive, got {}", capacity),
        ));
    }
    if allocatable < 0 || allocatable > capacity {
        return Err(ObserverError::computation(
            &node.name,
            format!(
                "allocatable memory {} outside capacity {}",
                allocatable, capacity
            ),
        ));
    }

    // Hundredths of a percent, rounded half-up in integer space.
    let used = (capacity - allocatable) as i128;
    let capacity = capacity as i128;
    let hundredths = (used * 10_000 * 2 + capacity) / (capacity * 2);

    Ok(hundredths as f64 / 100.0)
}

/// True iff the first `MemoryPressure` condition has status true
pub fn under_memory_pressure(node: &NodeSnapshot) -> bool {
    node.conditions
        .iter()
        .find(|c| c.type_ == MEMORY_PRESSURE)
        .map(|c| c.status)
        .unwrap_or(false)
}

/// Derive every metric for a node
pub fn derive(node: &NodeSnapshot) -> Result<DerivedMetrics> {
    Ok(DerivedMetrics {
        image_storage_bytes: image_storage_bytes(node),
        allocated_memory_percent: allocated_memory_percent(node)?,
        under_memory_pressure: under_memory_pressure(node),
    })
}

/// Format bytes with SI units, e.g. `500 MB` or `1.5 GB`
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB", "EB"];

    let sign = if bytes < 0 { "-" } else { "" };
    let magnitude = bytes.unsigned_abs();
    if magnitude < 10 {
        return format!("{}{} B", sign, magnitude);
    }

    let mut value = magnitude as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    let value = (value * 10.0 + 0.5).floor() / 10.0;
    if value < 10.0 {
        format!("{}{:.1} {}", sign, value, UNITS[unit])
    } else {
        format!("{}{:.0} {}", sign, value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node_with_memory(capacity: i64, allocatable: i64) -> NodeSnapshot {
        NodeSnapshot::new("test-node").with_memory(capacity, allocatable)
    }

    #[test]
    fn test_image_storage_empty() {
        let node = NodeSnapshot::new("empty");
        assert_eq!(image_storage_bytes(&node), 0);
    }

    #[test]
    fn test_image_storage_sum() {
        let node = NodeSnapshot::new("alpha").with_images([200_000_000, 300_000_000]);
        assert_eq!(image_storage_bytes(&node), 500_000_000);
    }

    proptest! {
        #[test]
        fn prop_image_storage_is_sum(sizes in proptest::collection::vec(0i64..1_000_000_000_000, 0..64)) {
            let expected: i64 = sizes.iter().sum();
            let node = NodeSnapshot::new("prop").with_images(sizes);
            prop_assert_eq!(image_storage_bytes(&node), expected);
        }
    }

    #[test]
    fn test_allocated_percent_quarter() {
        let node = node_with_memory(8_000_000_000, 6_000_000_000);
        assert_eq!(allocated_memory_percent(&node).unwrap(), 25.00);
    }

    #[test]
    fn test_allocated_percent_rounds_half_up() {
        // 12.345% of capacity committed
        let node = node_with_memory(100_000, 87_655);
        assert_eq!(allocated_memory_percent(&node).unwrap(), 12.35);

        // 12.344%
        let node = node_with_memory(100_000, 87_656);
        assert_eq!(allocated_memory_percent(&node).unwrap(), 12.34);
    }

    #[test]
    fn test_allocated_percent_bounds() {
        assert_eq!(
            allocated_memory_percent(&node_with_memory(1024, 1024)).unwrap(),
            0.0
        );
        assert_eq!(
            allocated_memory_percent(&node_with_memory(1024, 0)).unwrap(),
            100.0
        );
    }

    #[test]
    fn test_allocated_percent_zero_capacity() {
        let err = allocated_memory_percent(&node_with_memory(0, 0)).unwrap_err();
        assert_eq!(err.kind(), "computation");
    }

    #[test]
    fn test_allocated_percent_missing_fields() {
        let node = NodeSnapshot::new("bare");
        assert!(matches!(
            allocated_memory_percent(&node),
            Err(ObserverError::Computation { .. })
        ));
    }

    #[test]
    fn test_allocated_percent_allocatable_exceeds_capacity() {
        let node = node_with_memory(1_000, 2_000);
        assert!(allocated_memory_percent(&node).is_err());
    }

    #[test]
    fn test_memory_pressure() {
        let node = NodeSnapshot::new("n")
            .with_condition("Ready", true)
            .with_condition(MEMORY_PRESSURE, true);
        assert!(under_memory_pressure(&node));

        let node = NodeSnapshot::new("n").with_condition(MEMORY_PRESSURE, false);
        assert!(!under_memory_pressure(&node));

        let node = NodeSnapshot::new("n").with_condition("DiskPressure", true);
        assert!(!under_memory_pressure(&node));
    }

    #[test]
    fn test_memory_pressure_first_match_wins() {
        let node = NodeSnapshot::new("n")
            .with_condition(MEMORY_PRESSURE, false)
            .with_condition(MEMORY_PRESSURE, true);
        assert!(!under_memory_pressure(&node));
    }

    #[test]
    fn test_derive() {
        let node = NodeSnapshot::new("alpha")
            .with_images([500_000_000])
            .with_memory(8_000_000_000, 6_000_000_000)
            .with_condition(MEMORY_PRESSURE, true);

        let metrics = derive(&node).unwrap();
        assert_eq!(metrics.image_storage_bytes, 500_000_000);
        assert_eq!(metrics.allocated_memory_percent, 25.0);
        assert!(metrics.under_memory_pressure);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(999), "999 B");
        assert_eq!(format_bytes(1_500), "1.5 kB");
        assert_eq!(format_bytes(500_000_000), "500 MB");
        assert_eq!(format_bytes(700_000_000), "700 MB");
        assert_eq!(format_bytes(1_500_000_000), "1.5 GB");
    }
}
