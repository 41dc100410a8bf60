/// Default configuration constants for the durable circuit breaker

// Breaker defaults
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAK_DURATION_MS: u64 = 30_000;

// Database defaults
pub const DEFAULT_DB_FILENAME: &str = "circuit_breakers.db";
// Lock waits must fit inside one operation
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 2_000;

// Bounded-stale read cache
pub const DEFAULT_CACHE_STALENESS_MS: u64 = 1_000;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

// Circuit ids are used as primary keys
pub const MAX_CIRCUIT_ID_LENGTH: usize = 256;

pub const DATA_DIR_NAME: &str = "durable-breaker";
