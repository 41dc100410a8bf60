use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use durable_circuit_breaker::stability::timed;
use durable_circuit_breaker::{
    BreakerConfig, BreakerError, DurableCircuitBreaker, PermissionStrategyKind, SqliteStateStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BREAKER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let matches = Command::new("durable-breaker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Durable circuit breaker backed by a shared SQLite state store")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Path to a TOML configuration file")
                .global(true),
        )
        .subcommand(
            Command::new("demo")
                .about("Guard a deliberately fragile operation with the breaker")
                .arg(
                    Arg::new("circuit")
                        .long("circuit")
                        .value_name("ID")
                        .default_value("FooFragileOperation"),
                )
                .arg(
                    Arg::new("strategy")
                        .long("strategy")
                        .value_name("STRATEGY")
                        .help("consistency or throughput (defaults to the configured strategy)"),
                )
                .arg(
                    Arg::new("requests")
                        .long("requests")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("20"),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("4"),
                )
                .arg(
                    Arg::new("fail-every")
                        .long("fail-every")
                        .value_name("N")
                        .help("Make every Nth call of the fragile operation fail")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("2"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Print persisted breaker state")
                .arg(Arg::new("circuit").value_name("ID")),
        )
        .subcommand(Command::new("validate").about("Validate current configuration"))
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(Path::new);
    let config = BreakerConfig::load(config_path)?;

    match matches.subcommand() {
        Some(("demo", sub_matches)) => run_demo(config, sub_matches).await?,
        Some(("status", sub_matches)) => {
            show_status(config, sub_matches.get_one::<String>("circuit")).await?
        }
        Some(("validate", _)) => {
            config.validate()?;
            println!("✅ Configuration is valid ({})", config.database_path().display());
        }
        _ => {
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

async fn run_demo(config: BreakerConfig, matches: &ArgMatches) -> Result<()> {
    config.validate()?;

    let circuit_id = matches
        .get_one::<String>("circuit")
        .cloned()
        .unwrap_or_else(|| "FooFragileOperation".to_string());
    let requests = matches.get_one::<usize>("requests").copied().unwrap_or(20);
    let concurrency = matches.get_one::<usize>("concurrency").copied().unwrap_or(4).max(1);
    let fail_every = matches.get_one::<usize>("fail-every").copied().unwrap_or(2).max(1);

    let mut settings = config.settings_for(&circuit_id);
    if let Some(strategy) = matches.get_one::<String>("strategy") {
        settings.strategy = strategy
            .parse::<PermissionStrategyKind>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    let store = SqliteStateStore::new(&config.database_path(), &config.database)?;
    let breaker = Arc::new(
        DurableCircuitBreaker::new(Arc::new(store), config.clone()).with_circuit(circuit_id.clone(), settings),
    );
    info!(
        "Running {} requests against '{}' with {} workers ({})",
        requests,
        circuit_id,
        concurrency,
        settings.strategy.label()
    );

    let tally = Arc::new(DemoTally::default());
    let next_request = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::with_capacity(concurrency);

    for _ in 0..concurrency {
        let breaker = Arc::clone(&breaker);
        let tally = Arc::clone(&tally);
        let next_request = Arc::clone(&next_request);
        let circuit_id = circuit_id.clone();

        workers.push(tokio::spawn(async move {
            while next_request.fetch_add(1, Ordering::SeqCst) < requests {
                if let Err(e) = guarded_call(&breaker, &circuit_id, fail_every, &tally).await {
                    error!("Breaker unavailable for '{}': {}", circuit_id, e);
                    tally.store_errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    for result in futures::future::join_all(workers).await {
        result?;
    }

    let state = breaker.state(&circuit_id).await?;
    let summary = json!({
        "circuit_id": circuit_id,
        "strategy": settings.strategy,
        "requests": requests,
        "permitted": tally.permitted.load(Ordering::SeqCst),
        "rejected": tally.rejected.load(Ordering::SeqCst),
        "succeeded": tally.succeeded.load(Ordering::SeqCst),
        "failed": tally.failed.load(Ordering::SeqCst),
        "store_errors": tally.store_errors.load(Ordering::SeqCst),
        "final_state": state,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

#[derive(Default)]
struct DemoTally {
    calls: AtomicUsize,
    permitted: AtomicUsize,
    rejected: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    store_errors: AtomicUsize,
}

/// One protected call: permission check, fragile work, outcome report.
async fn guarded_call(
    breaker: &DurableCircuitBreaker,
    circuit_id: &str,
    fail_every: usize,
    tally: &DemoTally,
) -> Result<(), BreakerError> {
    let label = breaker.settings_for(circuit_id).strategy.label();

    let permitted = timed(
        &format!("{}:IsExecutionPermitted", label),
        breaker.is_permitted(circuit_id),
    )
    .await?;

    if !permitted {
        error!("{}: Service unavailable.", circuit_id);
        tally.rejected.fetch_add(1, Ordering::SeqCst);
        return Ok(());
    }
    tally.permitted.fetch_add(1, Ordering::SeqCst);

    match fragile_operation(&tally.calls, fail_every).await {
        Ok(message) => {
            timed(&format!("{}:RecordSuccess", label), breaker.record_success(circuit_id)).await?;
            info!("{}", message);
            tally.succeeded.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => {
            timed(&format!("{}:RecordFailure", label), breaker.record_failure(circuit_id)).await?;
            error!("{}: Exception: {}", circuit_id, e);
            tally.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    Ok(())
}

async fn fragile_operation(calls: &AtomicUsize, fail_every: usize) -> Result<String> {
    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::task::yield_now().await;

    if call % fail_every == 0 {
        return Err(anyhow::anyhow!("Something fragile went wrong."));
    }

    Ok("Hello world: from inside the operation guarded by the circuit-breaker.".to_string())
}

async fn show_status(config: BreakerConfig, circuit_id: Option<&String>) -> Result<()> {
    let store = SqliteStateStore::new(&config.database_path(), &config.database)?;

    let states = match circuit_id {
        Some(id) => {
            let breaker = DurableCircuitBreaker::new(Arc::new(store), config.clone());
            vec![breaker.state(id).await?]
        }
        None => store.list_circuits().await?,
    };

    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}
