use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::stability::state::BreakerState;

/// Snapshot cache backing bounded-stale reads.
///
/// Entries older than `staleness` are never returned. A zero staleness window
/// disables the cache. Each snapshot carries the order in which its store
/// operation completed; a snapshot never replaces a newer one.
pub struct SnapshotCache {
    entries: Mutex<HashMap<String, CachedSnapshot>>,
    max_entries: usize,
    staleness: Duration,
}

#[derive(Clone)]
struct CachedSnapshot {
    state: BreakerState,
    version: u64,
    cached_at: Instant,
}

impl SnapshotCache {
    pub fn new(max_entries: usize, staleness: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            staleness,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub fn get(&self, circuit_id: &str) -> Option<BreakerState> {
        if self.staleness.is_zero() {
            return None;
        }

        if let Ok(mut entries) = self.entries.lock() {
            if let Some(cached) = entries.get(circuit_id) {
                if cached.cached_at.elapsed() > self.staleness {
                    entries.remove(circuit_id);
                    debug!("Snapshot cache expired for circuit: {}", circuit_id);
                    return None;
                }

                debug!("Snapshot cache hit for circuit: {}", circuit_id);
                return Some(cached.state.clone());
            }
        }

        debug!("Snapshot cache miss for circuit: {}", circuit_id);
        None
    }

    /// Record a committed state. Called after every read or write that went
    /// to the backing store, with the version that operation was assigned.
    pub fn put(&self, state: &BreakerState, version: u64) {
        if self.staleness.is_zero() || self.max_entries == 0 {
            return;
        }

        if let Ok(mut entries) = self.entries.lock() {
            if let Some(cached) = entries.get(&state.circuit_id) {
                if cached.version > version {
                    debug!(
                        "Dropping out-of-order snapshot for circuit: {} (version {} < {})",
                        state.circuit_id, version, cached.version
                    );
                    return;
                }
            }

            if entries.len() >= self.max_entries && !entries.contains_key(&state.circuit_id) {
                Self::evict_oldest(&mut entries);
            }

            entries.insert(
                state.circuit_id.clone(),
                CachedSnapshot {
                    state: state.clone(),
                    version,
                    cached_at: Instant::now(),
                },
            );
        }
    }

    pub fn invalidate(&self, circuit_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(circuit_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_oldest(entries: &mut HashMap<String, CachedSnapshot>) {
        if let Some(oldest) = entries
            .iter()
            .min_by_key(|(_, cached)| cached.cached_at)
            .map(|(key, _)| key.clone())
        {
            entries.remove(&oldest);
        }
    }
}
