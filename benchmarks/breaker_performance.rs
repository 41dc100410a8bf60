use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use durable_circuit_breaker::config::DatabaseConfig;
use durable_circuit_breaker::{
    BreakerConfig, CircuitSettings, DurableCircuitBreaker, InMemoryStateStore, PermissionStrategyKind,
    SqliteStateStore, StateStore,
};

const CIRCUIT: &str = "bench-circuit";
const STRATEGIES: [PermissionStrategyKind; 2] = [
    PermissionStrategyKind::ConsistencyPriority,
    PermissionStrategyKind::ThroughputPriority,
];

fn breaker(store: Arc<dyn StateStore>, strategy: PermissionStrategyKind) -> DurableCircuitBreaker {
    DurableCircuitBreaker::new(store, BreakerConfig::default()).with_circuit(
        CIRCUIT,
        CircuitSettings {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            strategy,
        },
    )
}

/// Permission check hot path against the durable store
fn bench_sqlite_permission_checks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("sqlite_is_permitted");
    group.significance_level(0.1).sample_size(50);

    for strategy in STRATEGIES {
        let store = SqliteStateStore::open_in_memory(&DatabaseConfig::default()).unwrap();
        let breaker = breaker(Arc::new(store), strategy);

        group.bench_with_input(
            BenchmarkId::new("strategy", strategy.label()),
            &breaker,
            |b, breaker| {
                b.to_async(&rt)
                    .iter(|| async { black_box(breaker.is_permitted(CIRCUIT).await.unwrap()) });
            },
        );
    }

    group.finish();
}

/// Outcome recording, which always takes the per-key write path
fn bench_record_outcomes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("record_outcome");
    group.significance_level(0.1).sample_size(50);

    let stores: [(&str, Arc<dyn StateStore>); 2] = [
        ("memory", Arc::new(InMemoryStateStore::new())),
        (
            "sqlite",
            Arc::new(SqliteStateStore::open_in_memory(&DatabaseConfig::default()).unwrap()),
        ),
    ];

    for (name, store) in stores {
        let breaker = breaker(store, PermissionStrategyKind::ConsistencyPriority);

        group.bench_with_input(BenchmarkId::new("success", name), &breaker, |b, breaker| {
            b.to_async(&rt)
                .iter(|| async { black_box(breaker.record_success(CIRCUIT).await.unwrap()) });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sqlite_permission_checks, bench_record_outcomes);
criterion_main!(benches);
