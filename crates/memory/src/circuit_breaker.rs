//! Circuit breaker guarding background task execution.
//!
//! # States
//! - **Closed**: tasks run normally
//! - **Open**: tasks are deferred until the cool-down elapses
//! - **HalfOpen**: exactly one trial task runs; its outcome closes or
//!   re-opens the circuit
//!
//! All transitions happen under one mutex so concurrent workers cannot lose
//! updates to the failure count or state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mnemos_common::now_millis;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

/// How long a worker waits before re-checking a half-open circuit whose
/// trial is still running.
const TRIAL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Answer to "may this task run now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as the single half-open trial; the caller must report the
    /// outcome.
    Trial,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Unix millis when the circuit last opened
    pub opened_at: Option<u64>,
    pub total_rejections: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    opened_at_ms: Option<u64>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                opened_at_ms: None,
                trial_in_flight: false,
            }),
            total_rejections: AtomicU64::new(0),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// Checks admission, moving `open -> half_open` once the cool-down has
    /// elapsed.
    pub fn try_acquire(&self) -> Admission {
        let mut state = self.state.lock();
        let admission = match state.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown() {
                    info!(
                        cooldown_ms = self.config.cooldown_ms,
                        "Circuit breaker half-open, admitting trial"
                    );
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_after: self.cooldown() - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    Admission::Rejected {
                        retry_after: TRIAL_POLL.min(self.cooldown()),
                    }
                } else {
                    state.trial_in_flight = true;
                    Admission::Trial
                }
            }
        };
        if admission.is_rejected() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        admission
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                info!("Circuit breaker closing after successful trial");
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.opened_at = None;
                state.opened_at_ms = None;
                state.trial_in_flight = false;
            }
            // late result from a task admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = state.failure_count,
                        cooldown_ms = self.config.cooldown_ms,
                        "Circuit breaker opening"
                    );
                    Self::open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Trial task failed, circuit breaker re-opening");
                Self::open(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    fn open(state: &mut BreakerState) {
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.opened_at_ms = Some(now_millis());
        state.trial_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            state: state.state,
            failure_count: state.failure_count,
            opened_at: state.opened_at_ms,
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        })
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.try_acquire(), Admission::Allowed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_rejected());
        assert!(cb.snapshot().opened_at.is_some());
        assert_eq!(cb.snapshot().total_rejections, 1);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[test]
    fn rejection_reports_remaining_cooldown() {
        let cb = breaker(1, 60_000);
        cb.record_failure();
        match cb.try_acquire() {
            Admission::Rejected { retry_after } => {
                assert!(retry_after <= Duration::from_millis(60_000));
                assert!(retry_after > Duration::from_millis(50_000));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_rejected());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
        assert_eq!(cb.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn failed_trial_reopens_and_resets_timer() {
        let cb = breaker(1, 30);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.try_acquire(), Admission::Trial);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // cool-down restarted, so no immediate trial
        assert!(cb.try_acquire().is_rejected());
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let cb = std::sync::Arc::new(breaker(1_000, 60_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().failure_count, 800);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
