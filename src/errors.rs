use std::time::Duration;
use thiserror::Error;

/// Faults raised by a state store backend.
///
/// Every variant means the store could not give a trustworthy answer. Callers
/// above the store never map these to "permitted" or "denied".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State store unavailable: {message}")]
    Unavailable { message: String },

    #[error("State store operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("State store backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("Corrupt breaker record for '{circuit_id}': {message}")]
    CorruptRecord { circuit_id: String, message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }
}

/// Errors surfaced by [`crate::DurableCircuitBreaker`].
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The state store failed. The breaker cannot tell whether the call is
    /// permitted, so the calling operation must fail explicitly.
    #[error("Circuit breaker '{circuit_id}' state store unavailable: {source}")]
    StoreUnavailable {
        circuit_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Circuit breaker '{circuit_id}' rejected the call")]
    Rejected { circuit_id: String },

    #[error("Operation guarded by circuit breaker '{circuit_id}' failed: {source}")]
    Operation {
        circuit_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid circuit id: {message}")]
    InvalidCircuitId { message: String },

    #[error("Invalid settings for circuit '{circuit_id}': {message}")]
    InvalidSettings { circuit_id: String, message: String },
}

impl BreakerError {
    pub(crate) fn store(circuit_id: &str, source: StoreError) -> Self {
        BreakerError::StoreUnavailable {
            circuit_id: circuit_id.to_string(),
            source,
        }
    }

    /// True when the error came from the state store rather than the breaker
    /// decision or the guarded operation.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, BreakerError::StoreUnavailable { .. })
    }
}
