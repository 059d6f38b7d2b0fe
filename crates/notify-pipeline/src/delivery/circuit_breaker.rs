//! Per-worker circuit breaker: trips after a run of consecutive failures,
//! cools down for a fixed duration, then allows one trial request before
//! fully closing again.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    last_failure_at: RwLock<Option<Instant>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            last_failure_at: RwLock::new(None),
            failure_threshold,
            cooldown,
        }
    }

    pub fn allow_request(&self) -> bool {
        match *self.state.read() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.last_failure_at.read().map(|t| t.elapsed());
                if elapsed.is_some_and(|e| e >= self.cooldown) {
                    *self.state.write() = CircuitState::HalfOpen;
                    debug!("circuit breaker entering half-open trial");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut state = self.state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful trial");
            *state = CircuitState::Closed;
        }
    }

    pub fn record_failure(&self) {
        let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure_at.write() = Some(Instant::now());

        let mut state = self.state.write();
        match *state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopened, trial request failed");
                *state = CircuitState::Open;
            }
            CircuitState::Closed if count >= self.failure_threshold => {
                warn!(consecutive_failures = count, "circuit breaker opened");
                *state = CircuitState::Open;
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failure_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        assert!(breaker.allow_request());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn half_opens_after_cooldown_and_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn success_resets_consecutive_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
