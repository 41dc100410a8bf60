//! Fault-injecting store wrapper used to exercise store failures, slow
//! round-trips and call accounting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::{ReadMode, StateStore, TransitionRecord};
use crate::errors::StoreError;
use crate::stability::state::{BreakerState, CircuitSettings};

/// Store operations that can be failed individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Get,
    TransitionOnSuccess,
    TransitionOnFailure,
    TryAcquireHalfOpenProbe,
}

impl StoreOperation {
    pub fn name(&self) -> &'static str {
        match self {
            StoreOperation::Get => "get",
            StoreOperation::TransitionOnSuccess => "transition_on_success",
            StoreOperation::TransitionOnFailure => "transition_on_failure",
            StoreOperation::TryAcquireHalfOpenProbe => "try_acquire_half_open_probe",
        }
    }
}

/// Number of calls each store operation received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub strict_reads: usize,
    pub stale_reads: usize,
    pub success_transitions: usize,
    pub failure_transitions: usize,
    pub probe_acquisitions: usize,
}

impl StoreCallCounts {
    pub fn total(&self) -> usize {
        self.strict_reads
            + self.stale_reads
            + self.success_transitions
            + self.failure_transitions
            + self.probe_acquisitions
    }
}

#[derive(Default)]
struct Counters {
    strict_reads: AtomicUsize,
    stale_reads: AtomicUsize,
    success_transitions: AtomicUsize,
    failure_transitions: AtomicUsize,
    probe_acquisitions: AtomicUsize,
}

pub struct FaultInjectingStore {
    inner: Arc<dyn StateStore>,
    unavailable: AtomicBool,
    failures_remaining: AtomicUsize,
    failing_operation: Mutex<Option<StoreOperation>>,
    latency_ms: AtomicU64,
    counters: Counters,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
            failures_remaining: AtomicUsize::new(0),
            failing_operation: Mutex::new(None),
            latency_ms: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Fail every call until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` calls, then recover.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Fail every call of one operation while the others keep working.
    /// `None` clears it.
    pub fn fail_operation(&self, operation: Option<StoreOperation>) {
        if let Ok(mut failing) = self.failing_operation.lock() {
            *failing = operation;
        }
    }

    /// Delay every call before it reaches the wrapped store.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> StoreCallCounts {
        StoreCallCounts {
            strict_reads: self.counters.strict_reads.load(Ordering::SeqCst),
            stale_reads: self.counters.stale_reads.load(Ordering::SeqCst),
            success_transitions: self.counters.success_transitions.load(Ordering::SeqCst),
            failure_transitions: self.counters.failure_transitions.load(Ordering::SeqCst),
            probe_acquisitions: self.counters.probe_acquisitions.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        for counter in [
            &self.counters.strict_reads,
            &self.counters.stale_reads,
            &self.counters.success_transitions,
            &self.counters.failure_transitions,
            &self.counters.probe_acquisitions,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    async fn enter(&self, counter: &AtomicUsize, operation: StoreOperation) -> Result<(), StoreError> {
        let name = operation.name();
        counter.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            debug!("Injected store outage for {}", name);
            return Err(StoreError::unavailable(format!("injected outage during {}", name)));
        }

        let failing = self.failing_operation.lock().ok().and_then(|failing| *failing);
        if failing == Some(operation) {
            debug!("Injected failure for operation {}", name);
            return Err(StoreError::unavailable(format!("injected failure during {}", name)));
        }

        let consumed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok();
        if consumed {
            debug!("Injected store failure for {}", name);
            return Err(StoreError::unavailable(format!("injected failure during {}", name)));
        }

        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultInjectingStore {
    async fn get(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        mode: ReadMode,
        now: DateTime<Utc>,
    ) -> Result<BreakerState, StoreError> {
        let counter = match mode {
            ReadMode::Strict => &self.counters.strict_reads,
            ReadMode::BoundedStale => &self.counters.stale_reads,
        };
        self.enter(counter, StoreOperation::Get).await?;
        self.inner.get(circuit_id, settings, mode, now).await
    }

    async fn transition_on_success(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError> {
        self.enter(&self.counters.success_transitions, StoreOperation::TransitionOnSuccess).await?;
        self.inner.transition_on_success(circuit_id, settings, now).await
    }

    async fn transition_on_failure(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError> {
        self.enter(&self.counters.failure_transitions, StoreOperation::TransitionOnFailure).await?;
        self.inner.transition_on_failure(circuit_id, settings, now).await
    }

    async fn try_acquire_half_open_probe(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.enter(&self.counters.probe_acquisitions, StoreOperation::TryAcquireHalfOpenProbe).await?;
        self.inner.try_acquire_half_open_probe(circuit_id, settings, now).await
    }
}
