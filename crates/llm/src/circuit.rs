//! Per-backend circuit breaker.
//!
//! States:
//!   Closed:   normal operation, calls pass through
//!   Open:     calls rejected until the cooldown elapses
//!   HalfOpen: cooldown elapsed, exactly one trial call allowed
//!
//! All transitions happen under one `parking_lot::Mutex` per backend so
//! failures from concurrent sessions accumulate toward the same threshold.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Result of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial call.
    Trial,
    Rejected { retry_in: Duration },
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub failures: u64,
    /// Time since the circuit last opened, while it is open or half-open.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
    successes: u64,
    failures: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
                successes: 0,
                failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Decide whether a call may go through, moving Open to HalfOpen once the
    /// cooldown has elapsed.
    pub fn try_acquire(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.cooldown {
                    return Admission::Rejected {
                        retry_in: self.cooldown - elapsed,
                    };
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_started = Some(now);
                info!(provider = %self.name, "circuit half-open, sending trial call");
                Admission::Trial
            }
            CircuitState::HalfOpen => {
                // A trial call abandoned by a cancelled dispatch must not wedge the
                // breaker; after another cooldown a fresh trial call is allowed.
                let started = inner.trial_started.unwrap_or(now);
                let elapsed = now.saturating_duration_since(started);
                if elapsed >= self.cooldown {
                    inner.trial_started = Some(now);
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: self.cooldown - elapsed,
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.successes += 1;
        inner.consecutive_failures = 0;
        inner.trial_started = None;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!(provider = %self.name, "circuit closed");
        }
    }

    /// Count a failure.  Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_started = None;
                warn!(provider = %self.name, "half-open trial call failed, circuit re-opened");
                true
            }
            CircuitState::Closed if inner.consecutive_failures >= self.threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(
                    provider = %self.name,
                    failures = inner.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit opened"
                );
                true
            }
            _ => false,
        }
    }

    /// Force the circuit closed and clear the failure streak.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
        info!(provider = %self.name, "circuit manually reset");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            successes: inner.successes,
            failures: inner.failures,
            open_for: inner.opened_at.map(|at| Instant::now().saturating_duration_since(at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(300);

    #[test]
    fn opens_exactly_at_threshold() {
        let breaker = CircuitBreaker::new("ollama", 5, COOLDOWN);
        for _ in 0..4 {
            assert!(!breaker.record_failure());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire().is_admitted());
    }

    #[test]
    fn success_resets_the_streak() {
        let breaker = CircuitBreaker::new("ollama", 3, COOLDOWN);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown_allows_one_trial() {
        let breaker = CircuitBreaker::new("ollama", 1, COOLDOWN);
        breaker.record_failure();

        tokio::time::advance(COOLDOWN - Duration::from_secs(1)).await;
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.try_acquire(), Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Second caller while the trial call is in flight is turned away.
        assert!(!breaker.try_acquire().is_admitted());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_for_a_full_cooldown() {
        let breaker = CircuitBreaker::new("ollama", 1, COOLDOWN);
        breaker.record_failure();
        tokio::time::advance(COOLDOWN).await;
        assert_eq!(breaker.try_acquire(), Admission::Trial);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(COOLDOWN / 2).await;
        assert!(!breaker.try_acquire().is_admitted());
        tokio::time::advance(COOLDOWN / 2).await;
        assert_eq!(breaker.try_acquire(), Admission::Trial);
    }

    #[test]
    fn reset_closes_and_snapshot_reports_counts() {
        let breaker = CircuitBreaker::new("openrouter", 2, COOLDOWN);
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.failures, 2);
        assert_eq!(snap.successes, 1);
        assert!(snap.open_for.is_some());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
