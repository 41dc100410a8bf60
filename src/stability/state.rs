use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,   // Normal operation
    Open,     // Failing, reject requests
    HalfOpen, // Testing if service recovered
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitStatus::Closed),
            "open" => Ok(CircuitStatus::Open),
            "half_open" => Ok(CircuitStatus::HalfOpen),
            other => Err(format!("unknown circuit status '{}'", other)),
        }
    }
}

/// How permission checks are answered while a circuit is half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStrategyKind {
    /// Strictly serialized reads, one probe at a time in half-open.
    ConsistencyPriority,
    /// Possibly stale reads, any number of probes in half-open.
    ThroughputPriority,
}

impl PermissionStrategyKind {
    /// Label used for timing and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            PermissionStrategyKind::ConsistencyPriority => "ConsistencyPriority",
            PermissionStrategyKind::ThroughputPriority => "ThroughputPriority",
        }
    }
}

impl FromStr for PermissionStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consistency" | "consistency_priority" => Ok(PermissionStrategyKind::ConsistencyPriority),
            "throughput" | "throughput_priority" => Ok(PermissionStrategyKind::ThroughputPriority),
            other => Err(format!("unknown permission strategy '{}'", other)),
        }
    }
}

/// Per-circuit configuration, supplied when the circuit is first referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub break_duration: Duration,
    pub strategy: PermissionStrategyKind,
}

impl CircuitSettings {
    /// Threshold and break duration must both be positive.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure threshold must be greater than 0".to_string());
        }

        if self.break_duration.is_zero() {
            return Err("break duration must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: crate::config::defaults::DEFAULT_FAILURE_THRESHOLD,
            break_duration: Duration::from_millis(crate::config::defaults::DEFAULT_BREAK_DURATION_MS),
            strategy: PermissionStrategyKind::ConsistencyPriority,
        }
    }
}

/// Persisted record for one named circuit.
///
/// `failure_threshold` and `break_duration` are captured when the record is
/// created and are never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub circuit_id: String,
    pub status: CircuitStatus,
    pub consecutive_failure_count: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub half_open_probe_outstanding: bool,
    pub failure_threshold: u32,
    #[serde(with = "duration_millis")]
    pub break_duration: Duration,
}

impl BreakerState {
    /// A fresh, closed circuit.
    pub fn new(circuit_id: impl Into<String>, settings: &CircuitSettings) -> Self {
        Self {
            circuit_id: circuit_id.into(),
            status: CircuitStatus::Closed,
            consecutive_failure_count: 0,
            last_transition_at: None,
            half_open_probe_outstanding: false,
            failure_threshold: settings.failure_threshold,
            break_duration: settings.break_duration,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
