use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ReadMode, StateStore, TransitionRecord};
use crate::errors::StoreError;
use crate::stability::engine;
use crate::stability::state::{BreakerState, CircuitSettings};

/// Process-local store. Both read modes observe the latest write.
///
/// Not durable: state is lost when the process exits.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    circuits: Arc<Mutex<HashMap<String, BreakerState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored record, creating it if needed.
    pub fn put(&self, state: BreakerState) -> Result<(), StoreError> {
        let mut circuits = self.lock()?;
        circuits.insert(state.circuit_id.clone(), state);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, BreakerState>>, StoreError> {
        self.circuits
            .lock()
            .map_err(|_| StoreError::unavailable("in-memory store lock poisoned"))
    }

    fn with_circuit<R>(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        f: impl FnOnce(&mut BreakerState) -> R,
    ) -> Result<R, StoreError> {
        let mut circuits = self.lock()?;
        let state = circuits
            .entry(circuit_id.to_string())
            .or_insert_with(|| BreakerState::new(circuit_id, settings));
        Ok(f(state))
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        _mode: ReadMode,
        _now: DateTime<Utc>,
    ) -> Result<BreakerState, StoreError> {
        self.with_circuit(circuit_id, settings, |state| state.clone())
    }

    async fn transition_on_success(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError> {
        self.with_circuit(circuit_id, settings, |state| TransitionRecord {
            transition: engine::apply_success(state, now),
            state: state.clone(),
        })
    }

    async fn transition_on_failure(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError> {
        self.with_circuit(circuit_id, settings, |state| TransitionRecord {
            transition: engine::apply_failure(state, now),
            state: state.clone(),
        })
    }

    async fn try_acquire_half_open_probe(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_circuit(circuit_id, settings, |state| engine::try_grant_probe(state, now))
    }
}
