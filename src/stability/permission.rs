//! Permission strategies.
//!
//! Both strategies answer Closed and Open the same way. They only differ in
//! how a read is served and in who gets admitted while the circuit is
//! effectively half-open.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::engine;
use super::state::{CircuitSettings, CircuitStatus, PermissionStrategyKind};
use crate::errors::StoreError;
use crate::storage::{ReadMode, StateStore};

#[async_trait]
pub trait PermissionStrategy: Send + Sync {
    fn kind(&self) -> PermissionStrategyKind;

    fn read_mode(&self) -> ReadMode;

    async fn is_permitted(
        &self,
        store: &dyn StateStore,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Strict reads and a single probe in flight per circuit.
///
/// Costs a serialized read per check plus a conditional write when the
/// circuit is effectively half-open.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyPriority;

#[async_trait]
impl PermissionStrategy for ConsistencyPriority {
    fn kind(&self) -> PermissionStrategyKind {
        PermissionStrategyKind::ConsistencyPriority
    }

    fn read_mode(&self) -> ReadMode {
        ReadMode::Strict
    }

    async fn is_permitted(
        &self,
        store: &dyn StateStore,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = store.get(circuit_id, settings, self.read_mode(), now).await?;

        match engine::effective_status(&state, now) {
            CircuitStatus::Closed => Ok(true),
            CircuitStatus::Open => Ok(false),
            CircuitStatus::HalfOpen => {
                // The read is current, so a probe known to be in flight needs no write.
                if !engine::probe_available(&state, now) {
                    debug!("Circuit '{}' half-open probe already in flight", circuit_id);
                    return Ok(false);
                }

                let granted = store.try_acquire_half_open_probe(circuit_id, settings, now).await?;
                debug!(
                    "Circuit '{}' half-open probe {}",
                    circuit_id,
                    if granted { "granted" } else { "lost to a concurrent caller" }
                );
                Ok(granted)
            }
        }
    }
}

/// Possibly stale reads and unconditional admission while half-open.
///
/// Any number of trial calls may run until one outcome is recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThroughputPriority;

#[async_trait]
impl PermissionStrategy for ThroughputPriority {
    fn kind(&self) -> PermissionStrategyKind {
        PermissionStrategyKind::ThroughputPriority
    }

    fn read_mode(&self) -> ReadMode {
        ReadMode::BoundedStale
    }

    async fn is_permitted(
        &self,
        store: &dyn StateStore,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = store.get(circuit_id, settings, self.read_mode(), now).await?;

        Ok(match engine::effective_status(&state, now) {
            CircuitStatus::Closed | CircuitStatus::HalfOpen => true,
            CircuitStatus::Open => false,
        })
    }
}

pub(crate) fn strategy_for(kind: PermissionStrategyKind) -> &'static dyn PermissionStrategy {
    match kind {
        PermissionStrategyKind::ConsistencyPriority => &ConsistencyPriority,
        PermissionStrategyKind::ThroughputPriority => &ThroughputPriority,
    }
}
