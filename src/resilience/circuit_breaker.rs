//! Circuit breaker guarding a single backing dependency
//!
//! - Closed: calls flow; outcomes are kept in a time-based rolling window
//! - Open: calls are rejected without touching the dependency
//! - Half-open: a bounded number of trial calls are let through after the
//!   open timeout; enough successes close the circuit, any failure reopens it
//!
//! One breaker is shared by every caller of the dependency, so all state sits
//! behind a short-lived mutex and is never held across an await. Every state
//! change starts a new generation, and a permit only reports into the
//! generation that issued it.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0 - 1.0) within the window that trips the circuit
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the rate is considered
    pub minimum_requests: u32,
    /// Age after which recorded outcomes fall out of the window
    pub rolling_window: Duration,
    /// Time spent open before trial calls are admitted
    pub open_timeout: Duration,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_trials: u32,
    /// Successful trial calls required to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_requests: 10,
            rolling_window: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            half_open_max_trials: 1,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub window_requests: usize,
    pub window_failures: usize,
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    window: VecDeque<(Instant, bool)>,
    opened_at: Instant,
    trials_in_flight: u32,
    trial_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                window: VecDeque::new(),
                opened_at: Instant::now(),
                trials_in_flight: 0,
                trial_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance_timeout(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.advance_timeout(&mut inner);
        self.prune(&mut inner, Instant::now());
        let (window_requests, window_failures) = window_counts(&inner.window);

        CircuitBreakerStats {
            state: inner.state,
            window_requests,
            window_failures,
            failure_rate: failure_rate(window_requests, window_failures),
        }
    }

    /// Asks for permission to call the dependency.
    ///
    /// Returns `None` while open, or while half-open with every trial slot taken.
    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        self.advance_timeout(&mut inner);

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                if inner.trials_in_flight >= self.config.half_open_max_trials {
                    return None;
                }
                inner.trials_in_flight += 1;
                true
            }
        };

        Some(CallPermit {
            breaker: self,
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    fn record(&self, generation: u64, trial: bool, success: bool) {
        let mut inner = self.inner.lock();
        self.advance_timeout(&mut inner);
        let now = Instant::now();

        // issued before the last state change; its slot was reset with it
        if generation != inner.generation {
            return;
        }
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back((now, success));
                self.prune(&mut inner, now);
                let (requests, failures) = window_counts(&inner.window);
                if requests >= self.config.minimum_requests as usize
                    && failure_rate(requests, failures) >= self.config.failure_rate_threshold
                {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.generation += 1;
                        inner.window.clear();
                        inner.trial_successes = 0;
                        info!(breaker = self.name, "circuit closed");
                    }
                } else {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn release(&self, generation: u64, trial: bool) {
        if trial {
            let mut inner = self.inner.lock();
            if generation == inner.generation {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            }
        }
    }

    fn trip(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.generation += 1;
        inner.opened_at = now;
        inner.trial_successes = 0;
        inner.window.clear();
        warn!(
            breaker = self.name,
            open_for_ms = self.config.open_timeout.as_millis() as u64,
            "circuit opened"
        );
    }

    fn advance_timeout(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner.opened_at.elapsed() >= self.config.open_timeout
        {
            inner.state = CircuitState::HalfOpen;
            inner.generation += 1;
            inner.trials_in_flight = 0;
            inner.trial_successes = 0;
            info!(breaker = self.name, "circuit half-open");
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: Instant) {
        while let Some((recorded_at, _)) = inner.window.front() {
            if now.duration_since(*recorded_at) > self.config.rolling_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Outstanding permission to make one call.
///
/// Dropping a permit without settling it frees its trial slot without
/// counting as a success or a failure. Outcomes reported after the breaker
/// has changed state are ignored.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, true);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, false);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation, self.trial);
        }
    }
}

fn window_counts(window: &VecDeque<(Instant, bool)>) -> (usize, usize) {
    let failures = window.iter().filter(|(_, success)| !success).count();
    (window.len(), failures)
}

fn failure_rate(requests: usize, failures: usize) -> f64 {
    if requests == 0 {
        0.0
    } else {
        failures as f64 / requests as f64
    }
}
