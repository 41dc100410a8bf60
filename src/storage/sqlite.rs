use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

use super::{ReadMode, SnapshotCache, StateStore, TransitionRecord};
use crate::config::DatabaseConfig;
use crate::errors::StoreError;
use crate::stability::engine;
use crate::stability::state::{BreakerState, CircuitSettings, CircuitStatus};

const SELECT_COLUMNS: &str = "circuit_id, status, consecutive_failure_count, last_transition_at,
     half_open_probe_outstanding, failure_threshold, break_duration_ms";

type RawRow = (String, String, i64, Option<String>, bool, i64, i64);

/// How much longer than the operation timeout the caller waits for a
/// blocking operation that enforces its own deadline.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

/// SQLite-backed store.
///
/// Mutations run in `BEGIN IMMEDIATE` transactions, which serializes them per
/// database file across every process sharing it. Lock contention is absorbed
/// by SQLite's busy timeout; whatever outlives it is reported as a
/// [`StoreError`]. A transaction whose deadline passes before it commits is
/// rolled back, so an operation reported as timed out never takes effect.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
    cache: Arc<SnapshotCache>,
    versions: Arc<AtomicU64>,
    busy_timeout: Duration,
    operation_timeout: Duration,
}

/// Point after which an operation may no longer commit.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.remaining().is_zero() {
            return Err(self.expired());
        }
        Ok(())
    }

    fn expired(&self) -> StoreError {
        StoreError::Timeout {
            timeout: self.budget,
        }
    }
}

impl SqliteStateStore {
    pub fn new(db_path: &Path, config: &DatabaseConfig) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        Self::from_connection(conn, config)
    }

    /// Non-durable database, mostly useful in tests.
    pub fn open_in_memory(config: &DatabaseConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: &DatabaseConfig) -> Result<Self> {
        let operation_timeout = Duration::from_millis(config.operation_timeout_ms);
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms).min(operation_timeout);

        conn.busy_timeout(busy_timeout).context("Failed to set busy timeout")?;

        conn.execute_batch(&format!(
            "
            PRAGMA journal_mode = {};
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = memory;
            ",
            if config.enable_wal { "WAL" } else { "DELETE" },
        ))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            cache: Arc::new(SnapshotCache::new(
                config.cache_max_entries,
                Duration::from_millis(config.cache_staleness_ms),
            )),
            versions: Arc::new(AtomicU64::new(0)),
            busy_timeout,
            operation_timeout,
        };

        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database connection lock poisoned"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS circuit_breakers (
                circuit_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                consecutive_failure_count INTEGER NOT NULL DEFAULT 0,
                last_transition_at TEXT,
                half_open_probe_outstanding INTEGER NOT NULL DEFAULT 0,
                failure_threshold INTEGER NOT NULL,
                break_duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Every persisted circuit, ordered by id.
    pub async fn list_circuits(&self) -> Result<Vec<BreakerState>, StoreError> {
        self.run(|conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM circuit_breakers ORDER BY circuit_id",
                SELECT_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], read_raw_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(row_to_state).collect()
        })
        .await
    }

    pub fn staleness(&self) -> Duration {
        self.cache.staleness()
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, Deadline) -> Result<T, StoreError> + Send + 'static,
    {
        self.run_versioned(op).await.map(|(value, _)| value)
    }

    /// Run `op` on the blocking pool under the operation deadline.
    ///
    /// The returned version is taken while the connection is still held, so
    /// versions follow the order in which operations reached the database.
    async fn run_versioned<T, F>(&self, op: F) -> Result<(T, u64), StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, Deadline) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let versions = Arc::clone(&self.versions);
        let busy_timeout = self.busy_timeout;
        let deadline = Deadline::after(self.operation_timeout);

        let task = tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::unavailable("database connection lock poisoned"))?;

            // Time spent queued behind other local operations counts too.
            deadline.check()?;
            conn.busy_timeout(busy_timeout.min(deadline.remaining()))?;

            let value = op(&mut *conn, deadline).map_err(|e| lock_wait_exhausted(e, deadline))?;
            Ok((value, versions.fetch_add(1, Ordering::SeqCst) + 1))
        });

        match timeout(self.operation_timeout + DEADLINE_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StoreError::unavailable(format!(
                "database worker failed: {}",
                join_error
            ))),
            Err(_) => Err(deadline.expired()),
        }
    }

    async fn read_strict(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<BreakerState, StoreError> {
        let circuit_id = circuit_id.to_string();
        let settings = *settings;

        let (state, version) = self
            .run_versioned(move |conn, deadline| {
                if let Some(state) = select_state(conn, &circuit_id)? {
                    return Ok(state);
                }

                // Creation takes the write lock up front; upgrading a WAL read
                // snapshot to a writer can fail without waiting.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let state = load_or_create(&tx, &circuit_id, &settings, now)?;
                deadline.check()?;
                tx.commit()?;
                Ok(state)
            })
            .await?;

        self.cache.put(&state, version);
        Ok(state)
    }

    async fn mutate<T, F>(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<(T, BreakerState), StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut BreakerState) -> T + Send + 'static,
    {
        let circuit_id = circuit_id.to_string();
        let settings = *settings;

        let ((value, state), version) = self
            .run_versioned(move |conn, deadline| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut state = load_or_create(&tx, &circuit_id, &settings, now)?;
                let before = state.clone();

                let value = apply(&mut state);
                if state != before {
                    save(&tx, &state, now)?;
                }

                // Dropping the transaction rolls it back.
                deadline.check()?;
                tx.commit()?;
                Ok((value, state))
            })
            .await?;

        self.cache.put(&state, version);
        Ok((value, state))
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        mode: ReadMode,
        now: DateTime<Utc>,
    ) -> Result<BreakerState, StoreError> {
        if mode == ReadMode::BoundedStale {
            if let Some(state) = self.cache.get(circuit_id) {
                return Ok(state);
            }
        }

        self.read_strict(circuit_id, settings, now).await
    }

    async fn transition_on_success(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError> {
        let (transition, state) = self
            .mutate(circuit_id, settings, now, move |state| engine::apply_success(state, now))
            .await?;
        Ok(TransitionRecord { transition, state })
    }

    async fn transition_on_failure(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, StoreError> {
        let (transition, state) = self
            .mutate(circuit_id, settings, now, move |state| engine::apply_failure(state, now))
            .await?;
        Ok(TransitionRecord { transition, state })
    }

    async fn try_acquire_half_open_probe(
        &self,
        circuit_id: &str,
        settings: &CircuitSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (granted, _) = self
            .mutate(circuit_id, settings, now, move |state| engine::try_grant_probe(state, now))
            .await?;
        Ok(granted)
    }
}

/// A lock wait that ran out of busy timeout is a timeout, not a backend fault.
fn lock_wait_exhausted(error: StoreError, deadline: Deadline) -> StoreError {
    let busy = matches!(
        &error,
        StoreError::Backend(rusqlite::Error::SqliteFailure(failure, _))
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );

    if busy {
        debug!("Database lock wait exhausted: {}", error);
        return deadline.expired();
    }
    error
}

fn load_or_create(
    conn: &Connection,
    circuit_id: &str,
    settings: &CircuitSettings,
    now: DateTime<Utc>,
) -> Result<BreakerState, StoreError> {
    if let Some(state) = select_state(conn, circuit_id)? {
        return Ok(state);
    }

    let state = BreakerState::new(circuit_id, settings);
    conn.execute(
        "INSERT OR IGNORE INTO circuit_breakers
         (circuit_id, status, consecutive_failure_count, last_transition_at,
          half_open_probe_outstanding, failure_threshold, break_duration_ms, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            state.circuit_id,
            state.status.as_str(),
            state.consecutive_failure_count as i64,
            state.last_transition_at.map(|at| at.to_rfc3339()),
            state.half_open_probe_outstanding,
            state.failure_threshold as i64,
            state.break_duration.as_millis() as i64,
            now.to_rfc3339(),
        ],
    )?;
    debug!("Created breaker record for circuit '{}'", circuit_id);

    select_state(conn, circuit_id)?.ok_or_else(|| StoreError::CorruptRecord {
        circuit_id: circuit_id.to_string(),
        message: "record missing after insert".to_string(),
    })
}

fn save(conn: &Connection, state: &BreakerState, now: DateTime<Utc>) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE circuit_breakers
         SET status = ?2, consecutive_failure_count = ?3, last_transition_at = ?4,
             half_open_probe_outstanding = ?5, updated_at = ?6
         WHERE circuit_id = ?1",
        params![
            state.circuit_id,
            state.status.as_str(),
            state.consecutive_failure_count as i64,
            state.last_transition_at.map(|at| at.to_rfc3339()),
            state.half_open_probe_outstanding,
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn select_state(conn: &Connection, circuit_id: &str) -> Result<Option<BreakerState>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM circuit_breakers WHERE circuit_id = ?1", SELECT_COLUMNS),
            params![circuit_id],
            read_raw_row,
        )
        .optional()?;

    raw.map(row_to_state).transpose()
}

fn read_raw_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn row_to_state(raw: RawRow) -> Result<BreakerState, StoreError> {
    let (circuit_id, status, failures, last_transition_at, probe, threshold, break_ms) = raw;
    let corrupt = |message: String| StoreError::CorruptRecord {
        circuit_id: circuit_id.clone(),
        message,
    };

    let status = status.parse::<CircuitStatus>().map_err(&corrupt)?;
    let last_transition_at = last_transition_at
        .map(|text| {
            DateTime::parse_from_rfc3339(&text)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("invalid transition timestamp '{}': {}", text, e)))
        })
        .transpose()?;
    let consecutive_failure_count =
        u32::try_from(failures).map_err(|_| corrupt(format!("invalid failure count {}", failures)))?;
    let failure_threshold =
        u32::try_from(threshold).map_err(|_| corrupt(format!("invalid failure threshold {}", threshold)))?;
    let break_duration = u64::try_from(break_ms)
        .map(Duration::from_millis)
        .map_err(|_| corrupt(format!("invalid break duration {}", break_ms)))?;

    Ok(BreakerState {
        circuit_id,
        status,
        consecutive_failure_count,
        last_transition_at,
        half_open_probe_outstanding: probe,
        failure_threshold,
        break_duration,
    })
}
