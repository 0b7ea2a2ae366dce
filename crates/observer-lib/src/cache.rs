//! Change detection cache shared by the watch and poll loops
//!
//! Maps node name to the last recorded image storage total. The only way to
//! touch a value is [`ChangeCache::record_and_compare`], whose read and write
//! happen under one shard lock so concurrent observers cannot both report
//! the same transition or lose an update.
//!
//! Each entry also remembers when it was last observed, so that a listing
//! which started earlier cannot evict a node another observer saw since.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Outcome of comparing a new observation against the stored baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub changed: bool,
    /// Previous baseline, 0 on first observation
    pub old_bytes: i64,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    bytes: i64,
    observed_at: Instant,
}

/// Shared node name -> image storage baseline
///
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct ChangeCache {
    entries: Arc<DashMap<String, Baseline>>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `new_bytes` with the stored baseline and record it as the new
    /// baseline
    pub fn record_and_compare(&self, name: &str, new_bytes: i64) -> Change {
        let baseline = Baseline {
            bytes: new_bytes,
            observed_at: Instant::now(),
        };

        match self.entries.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let old_bytes = entry.get().bytes;
                entry.insert(baseline);
                Change {
                    changed: old_bytes != new_bytes,
                    old_bytes,
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(baseline);
                Change {
                    changed: true,
                    old_bytes: 0,
                }
            }
        }
    }

    /// Current baseline for a node
    pub fn get(&self, name: &str) -> Option<i64> {
        self.entries.get(name).map(|r| r.value().bytes)
    }

    /// Drop a node's baseline, returning it if present
    pub fn evict(&self, name: &str) -> Option<i64> {
        debug!(node = %name, "Evicting node from change cache");
        self.entries.remove(name).map(|(_, v)| v.bytes)
    }

    /// Evict nodes missing from a listing taken at `listed_at`, returning
    /// the evicted names
    ///
    /// Entries observed at or after `listed_at` are kept even when absent
    /// from `live`: the listing predates them.
    pub fn retain_only<'a>(
        &self,
        live: impl IntoIterator<Item = &'a str>,
        listed_at: Instant,
    ) -> Vec<String> {
        let live: HashSet<&str> = live.into_iter().collect();
        let mut evicted = Vec::new();

        self.entries.retain(|name, baseline| {
            let keep = live.contains(name.as_str()) || baseline.observed_at >= listed_at;
            if !keep {
                evicted.push(name.clone());
            }
            keep
        });

        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
