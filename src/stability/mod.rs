pub mod circuit_breaker;
pub mod clock;
pub mod engine;
pub mod permission;
pub mod state;
pub mod timing;

pub use circuit_breaker::DurableCircuitBreaker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::Transition;
pub use permission::{ConsistencyPriority, PermissionStrategy, ThroughputPriority};
pub use state::{BreakerState, CircuitSettings, CircuitStatus, PermissionStrategyKind};
pub use timing::{timed, Stopwatch};
