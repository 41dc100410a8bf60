use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::engine;
use super::permission::{strategy_for, PermissionStrategy};
use super::state::{BreakerState, CircuitSettings, CircuitStatus};
use crate::config::defaults::MAX_CIRCUIT_ID_LENGTH;
use crate::config::BreakerConfig;
use crate::errors::{BreakerError, StoreError};
use crate::storage::{ReadMode, StateStore, TransitionRecord};

/// Durable circuit breaker for fault tolerance
///
/// Holds no breaker state itself: every decision reads the shared record
/// through the [`StateStore`], so any number of instances pointed at the same
/// store behave as one breaker per circuit id.
pub struct DurableCircuitBreaker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
    overrides: HashMap<String, CircuitSettings>,
}

impl DurableCircuitBreaker {
    pub fn new(store: Arc<dyn StateStore>, config: BreakerConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            overrides: HashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings for `circuit_id` that win over the configuration.
    pub fn with_circuit(mut self, circuit_id: impl Into<String>, settings: CircuitSettings) -> Self {
        self.overrides.insert(circuit_id.into(), settings);
        self
    }

    pub fn settings_for(&self, circuit_id: &str) -> CircuitSettings {
        self.overrides
            .get(circuit_id)
            .copied()
            .unwrap_or_else(|| self.config.settings_for(circuit_id))
    }

    pub fn strategy_for(&self, circuit_id: &str) -> &'static dyn PermissionStrategy {
        strategy_for(self.settings_for(circuit_id).strategy)
    }

    /// Check if the circuit breaker allows a call.
    ///
    /// An open circuit yields `Ok(false)`; only a store fault is an error.
    pub async fn is_permitted(&self, circuit_id: &str) -> Result<bool, BreakerError> {
        let settings = self.checked_settings(circuit_id)?;
        let strategy = strategy_for(settings.strategy);

        let permitted = strategy
            .is_permitted(self.store.as_ref(), circuit_id, &settings, self.clock.now())
            .await
            .map_err(|e| self.store_failure(circuit_id, "is_permitted", e))?;

        if !permitted {
            debug!(
                "Circuit breaker '{}' denied execution ({})",
                circuit_id,
                strategy.kind().label()
            );
        }
        Ok(permitted)
    }

    pub async fn record_success(&self, circuit_id: &str) -> Result<(), BreakerError> {
        let settings = self.checked_settings(circuit_id)?;

        let record = self
            .store
            .transition_on_success(circuit_id, &settings, self.clock.now())
            .await
            .map_err(|e| self.store_failure(circuit_id, "record_success", e))?;

        self.log_transition(&record);
        Ok(())
    }

    pub async fn record_failure(&self, circuit_id: &str) -> Result<(), BreakerError> {
        let settings = self.checked_settings(circuit_id)?;

        let record = self
            .store
            .transition_on_failure(circuit_id, &settings, self.clock.now())
            .await
            .map_err(|e| self.store_failure(circuit_id, "record_failure", e))?;

        self.log_transition(&record);
        Ok(())
    }

    /// Current persisted record, read strictly.
    pub async fn state(&self, circuit_id: &str) -> Result<BreakerState, BreakerError> {
        let settings = self.checked_settings(circuit_id)?;

        self.store
            .get(circuit_id, &settings, ReadMode::Strict, self.clock.now())
            .await
            .map_err(|e| self.store_failure(circuit_id, "state", e))
    }

    /// Status a permission check would see right now, half-open included.
    pub async fn effective_status(&self, circuit_id: &str) -> Result<CircuitStatus, BreakerError> {
        let state = self.state(circuit_id).await?;
        Ok(engine::effective_status(&state, self.clock.now()))
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// The operation only runs when permitted, and its outcome is recorded.
    /// A failure to record the outcome is returned in place of the operation's
    /// own result.
    pub async fn execute<F, T, E>(&self, circuit_id: &str, operation: F) -> Result<T, BreakerError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        if !self.is_permitted(circuit_id).await? {
            return Err(BreakerError::Rejected {
                circuit_id: circuit_id.to_string(),
            });
        }

        match operation.await {
            Ok(value) => {
                self.record_success(circuit_id).await?;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(circuit_id).await?;
                Err(BreakerError::Operation {
                    circuit_id: circuit_id.to_string(),
                    source: e.into(),
                })
            }
        }
    }

    /// Validated id and settings, resolved before any store call.
    fn checked_settings(&self, circuit_id: &str) -> Result<CircuitSettings, BreakerError> {
        validate_circuit_id(circuit_id)?;

        let settings = self.settings_for(circuit_id);
        settings
            .validate()
            .map_err(|message| BreakerError::InvalidSettings {
                circuit_id: circuit_id.to_string(),
                message,
            })?;

        Ok(settings)
    }

    fn store_failure(&self, circuit_id: &str, operation: &str, error: StoreError) -> BreakerError {
        warn!(
            "Circuit breaker '{}' state store failed during {}: {}",
            circuit_id, operation, error
        );
        BreakerError::store(circuit_id, error)
    }

    fn log_transition(&self, record: &TransitionRecord) {
        let state = &record.state;

        if record.transition.opened() {
            warn!(
                "Circuit breaker '{}' transitioned to OPEN from {} after {} consecutive failures",
                state.circuit_id, record.transition.from, state.consecutive_failure_count
            );
        } else if record.transition.closed() {
            info!(
                "Circuit breaker '{}' transitioned to CLOSED from {}",
                state.circuit_id, record.transition.from
            );
        } else {
            debug!(
                "Circuit breaker '{}' remains {} ({} consecutive failures)",
                state.circuit_id, state.status, state.consecutive_failure_count
            );
        }
    }
}

fn validate_circuit_id(circuit_id: &str) -> Result<(), BreakerError> {
    if circuit_id.trim().is_empty() {
        return Err(BreakerError::InvalidCircuitId {
            message: "circuit id must not be empty".to_string(),
        });
    }

    if circuit_id.len() > MAX_CIRCUIT_ID_LENGTH {
        return Err(BreakerError::InvalidCircuitId {
            message: format!(
                "circuit id is {} characters, maximum is {}",
                circuit_id.len(),
                MAX_CIRCUIT_ID_LENGTH
            ),
        });
    }

    Ok(())
}
