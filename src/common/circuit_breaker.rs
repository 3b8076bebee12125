//! Circuit breaker around exchange requests
//!
//! Closed: requests flow. Open: requests are refused until the cool-down
//! elapses. HalfOpen: trial requests are let through; enough successes close
//! the breaker again, any failure re-opens it.
//!
//! Only transport-level failures should be recorded. An exchange rejecting an
//! order is a healthy venue.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failures_to_open: u32,
    /// Consecutive trial successes that close it
    pub successes_to_close: u32,
    pub cool_down: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failures_to_open: 5,
            successes_to_close: 2,
            cool_down: Duration::from_secs(60),
        }
    }
}

impl BreakerSettings {
    pub fn with_failures_to_open(mut self, n: u32) -> Self {
        self.failures_to_open = n;
        self
    }

    pub fn with_successes_to_close(mut self, n: u32) -> Self {
        self.successes_to_close = n;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: BreakerState,
    consecutive_failures: u32,
    trial_successes: u32,
    opened_at: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            trial_successes: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a request may be sent now. Moves Open to HalfOpen once the
    /// cool-down has elapsed.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.settings.cool_down);
                if cooled {
                    tracing::info!("Circuit breaker half-open, probing exchange");
                    self.state = BreakerState::HalfOpen;
                    self.trial_successes = 0;
                }
                cooled
            }
        }
    }

    pub fn on_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                self.trial_successes += 1;
                if self.trial_successes >= self.settings.successes_to_close {
                    tracing::info!("Circuit breaker closed");
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.trial_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.failures_to_open {
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    self.trip();
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!("Trial request failed, circuit breaker re-opened");
                self.trip();
            }
            BreakerState::Open => self.opened_at = Some(Instant::now()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_failures = 0;
        self.trial_successes = 0;
    }
}
