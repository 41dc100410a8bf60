use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use durable_circuit_breaker::stability::PermissionStrategy;
use durable_circuit_breaker::{
    BreakerConfig, BreakerError, CircuitSettings, CircuitStatus, Clock, DurableCircuitBreaker,
    FaultInjectingStore, InMemoryStateStore, ManualClock, PermissionStrategyKind, StateStore,
    StoreError, StoreOperation,
};

const CIRCUIT: &str = "FooFragileOperation";
const BREAK: Duration = Duration::from_secs(30);

fn settings(strategy: PermissionStrategyKind) -> CircuitSettings {
    CircuitSettings {
        failure_threshold: 3,
        break_duration: BREAK,
        strategy,
    }
}

fn breaker_over(
    store: Arc<dyn StateStore>,
    clock: Arc<ManualClock>,
    strategy: PermissionStrategyKind,
) -> Arc<DurableCircuitBreaker> {
    Arc::new(
        DurableCircuitBreaker::new(store, BreakerConfig::default())
            .with_clock(clock)
            .with_circuit(CIRCUIT, settings(strategy)),
    )
}

fn breaker(strategy: PermissionStrategyKind) -> (Arc<DurableCircuitBreaker>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let breaker = breaker_over(Arc::new(InMemoryStateStore::new()), Arc::clone(&clock), strategy);
    (breaker, clock)
}

async fn trip(breaker: &DurableCircuitBreaker) -> Result<()> {
    for _ in 0..3 {
        breaker.record_failure(CIRCUIT).await?;
    }
    Ok(())
}

/// Run `n` permission checks concurrently and return how many were permitted.
async fn concurrent_checks(breaker: &Arc<DurableCircuitBreaker>, n: usize) -> Result<usize> {
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let breaker = Arc::clone(breaker);
            tokio::spawn(async move { breaker.is_permitted(CIRCUIT).await })
        })
        .collect();

    let mut permitted = 0;
    for result in futures::future::join_all(handles).await {
        if result?? {
            permitted += 1;
        }
    }
    Ok(permitted)
}

#[cfg(test)]
mod state_machine_tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_circuit_is_closed_and_permitted() -> Result<()> {
        let (breaker, _) = breaker(PermissionStrategyKind::ConsistencyPriority);

        assert!(breaker.is_permitted(CIRCUIT).await?);

        let state = breaker.state(CIRCUIT).await?;
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failure_count, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_threshold_failures_open_the_circuit() -> Result<()> {
        for strategy in [
            PermissionStrategyKind::ConsistencyPriority,
            PermissionStrategyKind::ThroughputPriority,
        ] {
            let (breaker, _) = breaker(strategy);

            breaker.record_failure(CIRCUIT).await?;
            breaker.record_failure(CIRCUIT).await?;
            assert!(breaker.is_permitted(CIRCUIT).await?);

            breaker.record_failure(CIRCUIT).await?;
            assert!(!breaker.is_permitted(CIRCUIT).await?, "{:?} should deny", strategy);
            assert_eq!(breaker.effective_status(CIRCUIT).await?, CircuitStatus::Open);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_success_while_closed_clears_the_streak() -> Result<()> {
        let (breaker, _) = breaker(PermissionStrategyKind::ConsistencyPriority);

        breaker.record_failure(CIRCUIT).await?;
        breaker.record_failure(CIRCUIT).await?;
        breaker.record_success(CIRCUIT).await?;

        assert_eq!(breaker.state(CIRCUIT).await?.consecutive_failure_count, 0);

        // Two more failures are again below the threshold.
        breaker.record_failure(CIRCUIT).await?;
        breaker.record_failure(CIRCUIT).await?;
        assert!(breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_denied_until_break_duration_elapses() -> Result<()> {
        let (breaker, clock) = breaker(PermissionStrategyKind::ThroughputPriority);
        trip(&breaker).await?;

        clock.advance(BREAK - Duration::from_millis(1));
        assert!(!breaker.is_permitted(CIRCUIT).await?);
        assert_eq!(breaker.effective_status(CIRCUIT).await?, CircuitStatus::Open);

        clock.advance(Duration::from_millis(1));
        assert_eq!(breaker.effective_status(CIRCUIT).await?, CircuitStatus::HalfOpen);
        assert!(breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_and_restarts_the_window() -> Result<()> {
        let (breaker, clock) = breaker(PermissionStrategyKind::ConsistencyPriority);
        trip(&breaker).await?;
        clock.advance(BREAK);

        assert!(breaker.is_permitted(CIRCUIT).await?);
        breaker.record_failure(CIRCUIT).await?;

        let state = breaker.state(CIRCUIT).await?;
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.last_transition_at, Some(clock.now()));

        clock.advance(BREAK / 2);
        assert!(!breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }
}

#[cfg(test)]
mod consistency_priority_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_of_five_concurrent_probes_is_admitted() -> Result<()> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        // Latency widens the window between the read and the conditional write.
        store.set_latency(Duration::from_millis(5));
        let breaker = breaker_over(store, Arc::clone(&clock), PermissionStrategyKind::ConsistencyPriority);

        trip(&breaker).await?;
        assert!(!breaker.is_permitted(CIRCUIT).await?);

        clock.advance(BREAK);
        assert_eq!(concurrent_checks(&breaker, 5).await?, 1);

        breaker.record_success(CIRCUIT).await?;
        for _ in 0..5 {
            assert!(breaker.is_permitted(CIRCUIT).await?);
        }
        assert_eq!(breaker.state(CIRCUIT).await?.status, CircuitStatus::Closed);

        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_probe_blocks_for_another_break_duration() -> Result<()> {
        let (breaker, clock) = breaker(PermissionStrategyKind::ConsistencyPriority);
        trip(&breaker).await?;
        clock.advance(BREAK);

        // Probe admitted, caller never reports an outcome.
        assert!(breaker.is_permitted(CIRCUIT).await?);
        assert!(breaker.state(CIRCUIT).await?.half_open_probe_outstanding);

        clock.advance(BREAK - Duration::from_secs(1));
        assert!(!breaker.is_permitted(CIRCUIT).await?);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.is_permitted(CIRCUIT).await?);
        assert!(!breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_store_interactions_per_operation() -> Result<()> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        let breaker = breaker_over(store.clone(), Arc::clone(&clock), PermissionStrategyKind::ConsistencyPriority);

        breaker.is_permitted(CIRCUIT).await?;
        assert_eq!(store.calls().strict_reads, 1);
        assert_eq!(store.calls().total(), 1);

        store.reset_calls();
        breaker.record_failure(CIRCUIT).await?;
        breaker.record_success(CIRCUIT).await?;
        assert_eq!(store.calls().failure_transitions, 1);
        assert_eq!(store.calls().success_transitions, 1);
        assert_eq!(store.calls().total(), 2);

        trip(&breaker).await?;
        clock.advance(BREAK);
        store.reset_calls();
        assert!(breaker.is_permitted(CIRCUIT).await?);
        assert_eq!(store.calls().strict_reads, 1);
        assert_eq!(store.calls().probe_acquisitions, 1);

        // Probe already in flight: the strict read is enough to deny.
        store.reset_calls();
        assert!(!breaker.is_permitted(CIRCUIT).await?);
        assert_eq!(store.calls().total(), 1);

        Ok(())
    }
}

#[cfg(test)]
mod throughput_priority_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_concurrent_half_open_checks_are_admitted() -> Result<()> {
        let (breaker, clock) = breaker(PermissionStrategyKind::ThroughputPriority);
        trip(&breaker).await?;
        clock.advance(BREAK);

        assert_eq!(concurrent_checks(&breaker, 5).await?, 5);
        assert!(!breaker.state(CIRCUIT).await?.half_open_probe_outstanding);

        // One probe fails: the circuit re-opens with a fresh window.
        breaker.record_failure(CIRCUIT).await?;
        assert!(!breaker.is_permitted(CIRCUIT).await?);
        assert_eq!(breaker.state(CIRCUIT).await?.last_transition_at, Some(clock.now()));

        clock.advance(BREAK / 2);
        assert!(!breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_success_among_probes_closes_the_circuit() -> Result<()> {
        let (breaker, clock) = breaker(PermissionStrategyKind::ThroughputPriority);
        trip(&breaker).await?;
        clock.advance(BREAK);

        assert_eq!(concurrent_checks(&breaker, 5).await?, 5);
        breaker.record_success(CIRCUIT).await?;

        let state = breaker.state(CIRCUIT).await?;
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failure_count, 0);
        assert!(breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_checks_use_bounded_stale_reads_only() -> Result<()> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        let breaker = breaker_over(store.clone(), Arc::clone(&clock), PermissionStrategyKind::ThroughputPriority);

        trip(&breaker).await?;
        clock.advance(BREAK);
        store.reset_calls();

        for _ in 0..3 {
            assert!(breaker.is_permitted(CIRCUIT).await?);
        }

        let calls = store.calls();
        assert_eq!(calls.stale_reads, 3);
        assert_eq!(calls.strict_reads, 0);
        assert_eq!(calls.probe_acquisitions, 0);

        Ok(())
    }
}

#[cfg(test)]
mod store_failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_store_outage_is_surfaced_on_every_operation() -> Result<()> {
        for strategy in [
            PermissionStrategyKind::ConsistencyPriority,
            PermissionStrategyKind::ThroughputPriority,
        ] {
            let clock = Arc::new(ManualClock::default());
            let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
            let breaker = breaker_over(store.clone(), clock, strategy);

            store.set_unavailable(true);

            let permitted = breaker.is_permitted(CIRCUIT).await;
            assert!(matches!(permitted, Err(BreakerError::StoreUnavailable { .. })));
            assert!(breaker.record_success(CIRCUIT).await.unwrap_err().is_store_unavailable());
            assert!(breaker.record_failure(CIRCUIT).await.unwrap_err().is_store_unavailable());

            store.set_unavailable(false);
            let state = breaker.state(CIRCUIT).await?;
            assert_eq!(state.consecutive_failure_count, 0, "failed write must not be recorded");
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failure_is_not_retried_by_the_breaker() -> Result<()> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        let breaker = breaker_over(store.clone(), clock, PermissionStrategyKind::ConsistencyPriority);

        store.fail_next(1);
        assert!(breaker.is_permitted(CIRCUIT).await.is_err());
        assert_eq!(store.calls().strict_reads, 1);

        assert!(breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_half_open_write_is_surfaced_after_a_good_read() -> Result<()> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        let breaker = breaker_over(store.clone(), clock.clone(), PermissionStrategyKind::ConsistencyPriority);

        trip(&breaker).await?;
        clock.advance(BREAK);
        store.fail_operation(Some(StoreOperation::TryAcquireHalfOpenProbe));
        store.reset_calls();

        let err = breaker.is_permitted(CIRCUIT).await.unwrap_err();
        assert!(matches!(
            err,
            BreakerError::StoreUnavailable {
                source: StoreError::Unavailable { .. },
                ..
            }
        ));
        let calls = store.calls();
        assert_eq!(calls.strict_reads, 1);
        assert_eq!(calls.probe_acquisitions, 1);

        // Nothing was granted, so the trial call is still available.
        store.fail_operation(None);
        assert!(!breaker.state(CIRCUIT).await?.half_open_probe_outstanding);
        assert!(breaker.is_permitted(CIRCUIT).await?);
        assert!(!breaker.is_permitted(CIRCUIT).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_outcome_writes_leave_reads_working() -> Result<()> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        let breaker = breaker_over(store.clone(), clock, PermissionStrategyKind::ThroughputPriority);

        store.fail_operation(Some(StoreOperation::TransitionOnFailure));

        assert!(breaker.record_failure(CIRCUIT).await.unwrap_err().is_store_unavailable());
        assert!(breaker.is_permitted(CIRCUIT).await?);
        breaker.record_success(CIRCUIT).await?;
        assert_eq!(breaker.state(CIRCUIT).await?.consecutive_failure_count, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_circuit_settings_are_rejected_before_the_store() -> Result<()> {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        let breaker = DurableCircuitBreaker::new(store.clone(), BreakerConfig::default())
            .with_circuit(
                "zero-threshold",
                CircuitSettings {
                    failure_threshold: 0,
                    ..CircuitSettings::default()
                },
            )
            .with_circuit(
                "zero-break",
                CircuitSettings {
                    break_duration: Duration::ZERO,
                    ..CircuitSettings::default()
                },
            );

        assert!(matches!(
            breaker.is_permitted("zero-threshold").await,
            Err(BreakerError::InvalidSettings { .. })
        ));
        assert!(matches!(
            breaker.record_failure("zero-break").await,
            Err(BreakerError::InvalidSettings { .. })
        ));
        assert!(matches!(
            breaker.state("zero-threshold").await,
            Err(BreakerError::InvalidSettings { .. })
        ));
        assert_eq!(store.calls().total(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_circuit_ids_are_rejected_before_the_store() -> Result<()> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryStateStore::new())));
        let breaker = breaker_over(store.clone(), clock, PermissionStrategyKind::ConsistencyPriority);

        assert!(matches!(
            breaker.is_permitted("  ").await,
            Err(BreakerError::InvalidCircuitId { .. })
        ));
        assert!(matches!(
            breaker.record_failure(&"x".repeat(300)).await,
            Err(BreakerError::InvalidCircuitId { .. })
        ));
        assert_eq!(store.calls().total(), 0);

        Ok(())
    }
}

#[cfg(test)]
mod execute_tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_records_outcomes() -> Result<()> {
        let (breaker, _) = breaker(PermissionStrategyKind::ConsistencyPriority);

        let value = breaker
            .execute(CIRCUIT, async { Ok::<_, anyhow::Error>("hello") })
            .await?;
        assert_eq!(value, "hello");

        let failed = breaker
            .execute(CIRCUIT, async { Err::<(), _>(anyhow::anyhow!("Something fragile went wrong.")) })
            .await;
        assert!(matches!(failed, Err(BreakerError::Operation { .. })));
        assert_eq!(breaker.state(CIRCUIT).await?.consecutive_failure_count, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_execute_skips_operation_when_open() -> Result<()> {
        let (breaker, _) = breaker(PermissionStrategyKind::ThroughputPriority);
        trip(&breaker).await?;

        let runs = AtomicUsize::new(0);
        let result = breaker
            .execute(CIRCUIT, async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Rejected { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_configured_overrides_apply_per_circuit() -> Result<()> {
        let config = BreakerConfig::from_toml(
            r#"
            [defaults]
            failure_threshold = 5

            [circuits.payments]
            failure_threshold = 1
            strategy = "throughput_priority"
            "#,
        )?;
        let breaker = DurableCircuitBreaker::new(Arc::new(InMemoryStateStore::new()), config)
            .with_clock(Arc::new(ManualClock::default()));

        breaker.record_failure("payments").await?;
        breaker.record_failure("inventory").await?;

        assert!(!breaker.is_permitted("payments").await?);
        assert!(breaker.is_permitted("inventory").await?);
        assert_eq!(
            breaker.strategy_for("payments").kind(),
            PermissionStrategyKind::ThroughputPriority
        );

        Ok(())
    }
}
