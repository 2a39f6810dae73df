//! A small TTL cache for station flow data.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::flow::StationFlowData;

/// Default time-to-live for cached flow data.
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(60 * 60);

struct Entry {
    data: StationFlowData,
    expires_at: Instant,
}

/// Flow data keyed by `normalizedStation|normalizedLine`.
///
/// Writes replace the whole entry. Two callers racing on a cold key may both
/// fetch upstream; the last write wins.
pub struct FlowCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl FlowCache {
    /// Create an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Look up a fresh entry.
    pub fn get(&self, key: &str) -> Option<StationFlowData> {
        self.get_at(key, Instant::now())
    }

    /// Look up an entry as of `now`. Expired entries are dropped.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<StationFlowData> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        None
    }

    /// Store an entry.
    pub fn insert(&self, key: String, data: StationFlowData) {
        self.insert_at(key, data, Instant::now());
    }

    /// Store an entry as of `now`.
    pub fn insert_at(&self, key: String, data: StationFlowData, now: Instant) {
        self.entries.insert(
            key,
            Entry {
                data,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for FlowCache {
    fn default() -> Self {
        Self::new(DEFAULT_FLOW_TTL)
    }
}
