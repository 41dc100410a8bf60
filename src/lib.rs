pub mod config;
pub mod errors;
pub mod stability;
pub mod storage;

// Re-export commonly used types
pub use config::BreakerConfig;
pub use errors::{BreakerError, StoreError};
pub use stability::{
    BreakerState, CircuitSettings, CircuitStatus, Clock, DurableCircuitBreaker, ManualClock,
    PermissionStrategyKind, SystemClock,
};
pub use storage::{
    FaultInjectingStore, InMemoryStateStore, ReadMode, SqliteStateStore, StateStore, StoreOperation,
};
