pub mod cache;
pub mod fault;
pub mod memory;
pub mod sqlite;

pub use cache::SnapshotCache;
pub use fault::{FaultInjectingStore, StoreCallCounts, StoreOperation};
pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::stability::engine::Transition;
use crate::stability::state::{BreakerState, CircuitSettings};

/// Read consistency requested from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Observe the latest committed write for the key.
    Strict,
    /// May observe an older committed value, no older than the store's
    /// configured staleness window.
    BoundedStale,
}

/// Result of applying an outcome to a stored circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub transition: Transition,
    pub state: BreakerState,
}

/// Durable storage for breaker records, one per circuit id.
///
/// Implementations must linearize mutations per circuit id: two concurrent
/// read-modify-write operations on the same key never lose an update. Write
/// conflicts are resolved inside the store; anything it cannot resolve is
/// reported as a [`StoreError`].
///
/// `settings` are only used when the circuit id has never been seen, to create
/// its record. Existing records keep the settings they were created with.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        mode: ReadMode,
        now: DateTime<Utc>,
    ) -> Result<BreakerState, StoreError>;

    async fn transition_on_success(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError>;

    async fn transition_on_failure(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError>;

    /// Atomically check and set the half-open probe flag.
    async fn try_acquire_half_open_probe(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
