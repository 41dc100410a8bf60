//! Breaker state machine.
//!
//! ```text
//! Closed   -> Open:     consecutive failures reach the threshold
//! Open     -> HalfOpen: computed at read time once the break duration elapsed
//! HalfOpen -> Closed:   a probe succeeds
//! HalfOpen -> Open:     a probe fails, regardless of the threshold
//! ```
//!
//! Every function here is pure over `(state, now)`. Stores call them inside
//! their per-key atomic section, so these are the only code paths that mutate
//! a [`BreakerState`].

use chrono::{DateTime, Utc};

use super::state::{BreakerState, CircuitStatus};

/// Status change produced by applying one outcome.
///
/// `from` is the effective status before the outcome, `to` the stored status
/// after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitStatus,
    pub to: CircuitStatus,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }

    pub fn opened(&self) -> bool {
        self.to == CircuitStatus::Open && self.from != CircuitStatus::Open
    }

    pub fn closed(&self) -> bool {
        self.to == CircuitStatus::Closed && self.from != CircuitStatus::Closed
    }
}

/// Whether the break window that started at the last transition has passed.
///
/// A circuit that never transitioned counts as elapsed. A timestamp in the
/// future (clock skew between instances) counts as not elapsed.
pub fn break_elapsed(state: &BreakerState, now: DateTime<Utc>) -> bool {
    let Some(since) = state.last_transition_at else {
        return true;
    };

    match now.signed_duration_since(since).to_std() {
        Ok(elapsed) => elapsed >= state.break_duration,
        Err(_) => false,
    }
}

/// Status as seen by a permission check at `now`.
pub fn effective_status(state: &BreakerState, now: DateTime<Utc>) -> CircuitStatus {
    match state.status {
        CircuitStatus::Closed => CircuitStatus::Closed,
        CircuitStatus::Open if break_elapsed(state, now) => CircuitStatus::HalfOpen,
        CircuitStatus::Open => CircuitStatus::Open,
        CircuitStatus::HalfOpen => CircuitStatus::HalfOpen,
    }
}

/// Whether a single-probe check could admit a trial call right now.
///
/// An outstanding probe blocks further probes until its own break window
/// elapses; after that it is treated as abandoned.
pub fn probe_available(state: &BreakerState, now: DateTime<Utc>) -> bool {
    effective_status(state, now) == CircuitStatus::HalfOpen
        && (!state.half_open_probe_outstanding || break_elapsed(state, now))
}

/// Check-and-set of the half-open probe flag.
///
/// Returns true without touching the record when the circuit is closed.
/// Granting a probe records a transition into half-open, which restarts the
/// break window for the next probe.
pub fn try_grant_probe(state: &mut BreakerState, now: DateTime<Utc>) -> bool {
    match effective_status(state, now) {
        CircuitStatus::Closed => true,
        CircuitStatus::Open => false,
        CircuitStatus::HalfOpen => {
            if !probe_available(state, now) {
                return false;
            }
            state.status = CircuitStatus::HalfOpen;
            state.half_open_probe_outstanding = true;
            state.last_transition_at = Some(now);
            true
        }
    }
}

/// Apply one successful outcome.
pub fn apply_success(state: &mut BreakerState, now: DateTime<Utc>) -> Transition {
    let from = effective_status(state, now);

    match from {
        CircuitStatus::Closed => {
            state.consecutive_failure_count = 0;
        }
        CircuitStatus::HalfOpen => {
            state.status = CircuitStatus::Closed;
            state.consecutive_failure_count = 0;
            state.half_open_probe_outstanding = false;
        }
        // Late report from a call admitted before the circuit tripped.
        CircuitStatus::Open => {}
    }

    Transition { from, to: state.status }
}

/// Apply one failed outcome.
pub fn apply_failure(state: &mut BreakerState, now: DateTime<Utc>) -> Transition {
    let from = effective_status(state, now);
    state.consecutive_failure_count = state.consecutive_failure_count.saturating_add(1);

    match from {
        CircuitStatus::Closed => {
            if state.consecutive_failure_count >= state.failure_threshold {
                trip(state, now);
            }
        }
        CircuitStatus::HalfOpen => trip(state, now),
        // Window is not extended by failures of calls admitted before the trip.
        CircuitStatus::Open => {}
    }

    Transition { from, to: state.status }
}

fn trip(state: &mut BreakerState, now: DateTime<Utc>) {
    state.status = CircuitStatus::Open;
    state.last_transition_at = Some(now);
    state.half_open_probe_outstanding = false;
}
