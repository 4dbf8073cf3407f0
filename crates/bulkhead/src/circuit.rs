//! Circuit breaker over consecutive executor failures.

use std::collections::VecDeque;
use std::time::Duration;

use hive_core::{CircuitConfig, CircuitState};
use parking_lot::Mutex;
use tokio::time::Instant;

/// A state change the caller should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitChange {
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Consecutive failures counted when the change happened
    pub failures: usize,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Trips open after `failure_threshold` consecutive failures inside
/// `window`, rejects for `cooldown`, then lets exactly one trial through.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Circuit>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Circuit {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Current state as last recorded.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Time left before an open breaker admits a trial.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                let ready = opened + self.config.cooldown();
                let now = Instant::now();
                (ready > now).then(|| ready - now)
            }
            _ => None,
        }
    }

    /// Ask to run an operation.
    ///
    /// `Err` carries how long to wait. `Ok` may carry the `open -> half_open`
    /// change when this call becomes the trial.
    pub fn admit(&self) -> Result<Option<CircuitChange>, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let opened = inner.opened_at.unwrap_or_else(Instant::now);
                let ready = opened + self.config.cooldown();
                let now = Instant::now();
                if now < ready {
                    return Err(ready - now);
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(Some(CircuitChange {
                    from: CircuitState::Open,
                    to: CircuitState::HalfOpen,
                    failures: inner.failures.len(),
                }))
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(self.config.cooldown()),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(None)
            }
        }
    }

    /// The admitted operation never ran (for example its reservation was refused).
    pub fn cancel_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// Record a successful operation.
    pub fn record_success(&self) -> Option<CircuitChange> {
        let mut inner = self.inner.lock();
        let failures = inner.failures.len();
        inner.failures.clear();
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                Some(CircuitChange { from: CircuitState::HalfOpen, to: CircuitState::Closed, failures })
            }
            _ => None,
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) -> Option<CircuitChange> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.trial_in_flight = false;

        let window = self.config.window();
        while inner.failures.front().is_some_and(|t| now.duration_since(*t) > window) {
            inner.failures.pop_front();
        }
        inner.failures.push_back(now);
        let failures = inner.failures.len();

        let from = inner.state;
        let trips = match from {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.config.failure_threshold.max(1),
            CircuitState::Open => false,
        };
        if !trips {
            return None;
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        Some(CircuitChange { from, to: CircuitState::Open, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let cb = breaker();
        assert!(cb.record_failure().is_none());
        assert!(cb.record_failure().is_none());
        let change = cb.record_failure().unwrap();
        assert_eq!(change.from, CircuitState::Closed);
        assert_eq!(change.to, CircuitState::Open);
        assert_eq!(change.failures, 3);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.admit(), Err(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert!(cb.record_failure().is_none());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_fall_out_of_window() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert!(cb.record_failure().is_none());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.retry_after(), Some(Duration::from_secs(30)));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.retry_after(), None);

        let change = cb.admit().unwrap().unwrap();
        assert_eq!(change.to, CircuitState::HalfOpen);
        assert!(cb.admit().is_err());

        let change = cb.record_success().unwrap();
        assert_eq!(change.to, CircuitState::Closed);
        assert_eq!(cb.admit(), Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        cb.admit().unwrap();
        let change = cb.record_failure().unwrap();
        assert_eq!(change.from, CircuitState::HalfOpen);
        assert_eq!(change.to, CircuitState::Open);
        assert!(cb.admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_the_slot() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        cb.admit().unwrap();
        cb.cancel_trial();
        assert_eq!(cb.admit(), Ok(None));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }
}
