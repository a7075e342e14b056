//! Per-source circuit breaker state machine.
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[window]--> HALF_OPEN (one probe)
//!                                                                        |
//!                                      <--[probe failure]--              |
//!                                                                        |
//! CLOSED <--------------------------[probe success]----------------------+
//! ```
//!
//! The transition function is pure over an explicit `now` so both the
//! in-process and the shared-store coordination backends reuse it with
//! identical semantics, and so tests never need to sleep.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;

/// Current state of one source's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            _ => Err(format!("Unknown circuit state: {s}")),
        }
    }
}

/// What a dispatch attempt is allowed to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Circuit closed; dispatch normally.
    Allow,
    /// Circuit half-open and this caller holds the single probe slot.
    Probe,
    /// Circuit open (or a probe is already in flight); fail fast.
    Open { retry_after: Duration },
}

impl BreakerDecision {
    pub fn permits_dispatch(&self) -> bool {
        !matches!(self, BreakerDecision::Open { .. })
    }
}

/// Mutable per-source breaker record. Owned exclusively by a coordination
/// backend; all mutation goes through `check` / `record_success` /
/// `record_failure`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Set while a half-open probe is in flight; doubles as the probe
    /// reservation so exactly one caller gets `Probe`.
    pub half_open_probe_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a dispatch may proceed, applying the lazy
    /// open -> half-open transition when the window has elapsed.
    pub fn check(&mut self, now: DateTime<Utc>, config: &BreakerConfig) -> BreakerDecision {
        match self.state {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                let opened = self.opened_at.unwrap_or(now);
                let elapsed = (now - opened).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= config.open_window {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_probe_at = Some(now);
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Open {
                        retry_after: config.open_window - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_probe_at.is_some() {
                    // A probe is in flight; everyone else fails fast until
                    // its outcome is recorded.
                    BreakerDecision::Open {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    self.half_open_probe_at = Some(now);
                    BreakerDecision::Probe
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
                self.half_open_probe_at = None;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failure. Returns true when this failure opened the circuit.
    pub fn record_failure(&mut self, now: DateTime<Utc>, config: &BreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // Failed probe: back to open with a fresh window.
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.failure_count = config.failure_threshold;
                self.half_open_probe_at = None;
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Read-only view of the state with the lazy half-open transition
    /// applied (without reserving a probe).
    pub fn effective_state(&self, now: DateTime<Utc>, config: &BreakerConfig) -> CircuitState {
        if self.state == CircuitState::Open
            && let Some(opened) = self.opened_at
            && (now - opened).to_std().unwrap_or(Duration::ZERO) >= config.open_window
        {
            return CircuitState::HalfOpen;
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn config(threshold: u32, window_secs: i64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            open_window: Duration::from_secs(window_secs as u64),
        }
    }

    #[test]
    fn test_starts_closed() {
        let mut record = BreakerRecord::new();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(
            record.check(Utc::now(), &config(3, 60)),
            BreakerDecision::Allow
        );
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let config = config(3, 60);
        let mut record = BreakerRecord::new();
        let now = Utc::now();

        assert!(!record.record_failure(now, &config));
        assert!(!record.record_failure(now, &config));
        assert!(record.record_failure(now, &config));
        assert_eq!(record.state, CircuitState::Open);

        match record.check(now, &config) {
            BreakerDecision::Open { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let config = config(5, 60);
        let mut record = BreakerRecord::new();
        let now = Utc::now();
        for _ in 0..4 {
            record.record_failure(now, &config);
        }
        assert_eq!(record.state, CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let config = config(5, 60);
        let mut record = BreakerRecord::new();
        let now = Utc::now();
        for _ in 0..4 {
            record.record_failure(now, &config);
        }
        record.record_success();
        for _ in 0..4 {
            record.record_failure(now, &config);
        }
        assert_eq!(record.state, CircuitState::Closed);
    }

    #[test]
    fn test_window_expiry_admits_exactly_one_probe() {
        let config = config(1, 30);
        let mut record = BreakerRecord::new();
        let opened_at = Utc::now();
        record.record_failure(opened_at, &config);
        assert_eq!(record.state, CircuitState::Open);

        let later = opened_at + TimeDelta::seconds(31);
        assert_eq!(record.check(later, &config), BreakerDecision::Probe);
        assert_eq!(record.state, CircuitState::HalfOpen);

        // Second concurrent caller is rejected while the probe is in flight.
        assert!(matches!(
            record.check(later, &config),
            BreakerDecision::Open { .. }
        ));
    }

    #[test]
    fn test_probe_success_closes_and_resets() {
        let config = config(2, 30);
        let mut record = BreakerRecord::new();
        let t0 = Utc::now();
        record.record_failure(t0, &config);
        record.record_failure(t0, &config);

        let t1 = t0 + TimeDelta::seconds(31);
        assert_eq!(record.check(t1, &config), BreakerDecision::Probe);
        record.record_success();

        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.check(t1, &config), BreakerDecision::Allow);
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_window() {
        let config = config(2, 30);
        let mut record = BreakerRecord::new();
        let t0 = Utc::now();
        record.record_failure(t0, &config);
        record.record_failure(t0, &config);

        let t1 = t0 + TimeDelta::seconds(31);
        assert_eq!(record.check(t1, &config), BreakerDecision::Probe);
        assert!(record.record_failure(t1, &config));
        assert_eq!(record.state, CircuitState::Open);

        // Window restarts from the probe failure, not the original opening.
        assert!(matches!(
            record.check(t1 + TimeDelta::seconds(29), &config),
            BreakerDecision::Open { .. }
        ));
        assert_eq!(
            record.check(t1 + TimeDelta::seconds(31), &config),
            BreakerDecision::Probe
        );
    }

    #[test]
    fn test_effective_state_does_not_reserve_probe() {
        let config = config(1, 30);
        let mut record = BreakerRecord::new();
        let t0 = Utc::now();
        record.record_failure(t0, &config);

        let t1 = t0 + TimeDelta::seconds(31);
        assert_eq!(record.effective_state(t1, &config), CircuitState::HalfOpen);
        // Probe slot still available afterwards.
        assert_eq!(record.check(t1, &config), BreakerDecision::Probe);
    }
}
