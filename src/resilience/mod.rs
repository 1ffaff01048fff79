//! Fault tolerance for calls to a backing dependency
//!
//! [`Resilience`] pairs one shared [`CircuitBreaker`] with a [`RetryPolicy`].
//! Each attempt asks the breaker first, so an open circuit fails fast even in
//! the middle of a retry sequence.

pub mod circuit_breaker;
pub mod retry;

use std::future::Future;

use thiserror::Error;
use tracing::warn;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::RetryPolicy;

/// Failures that may succeed if simply tried again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("circuit open for {0}")]
    CircuitOpen(&'static str),
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Failed {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: E,
    },
}

#[derive(Debug)]
pub struct Resilience {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl Resilience {
    pub fn new(name: &'static str, breaker: CircuitBreakerConfig, retry: RetryPolicy) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, breaker),
            retry,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Runs `call` under the breaker, retrying transient failures with backoff.
    ///
    /// Non-transient failures are returned at once and are not held against
    /// the dependency's health.
    pub async fn call<T, E, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let Some(permit) = self.breaker.acquire() else {
                warn!(operation, attempt, "backing store call rejected, circuit open");
                return Err(ResilienceError::CircuitOpen(operation));
            };

            match call().await {
                Ok(value) => {
                    permit.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    permit.record_failure();
                    if attempt >= max_attempts {
                        warn!(operation, attempts = attempt, error = %err, "backing store call exhausted retries");
                        return Err(ResilienceError::Failed {
                            operation,
                            attempts: attempt,
                            source: err,
                        });
                    }

                    let delay = self.retry.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backing store failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    drop(permit);
                    return Err(ResilienceError::Failed {
                        operation,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("connection reset")]
        Reset,
        #[error("wrong type")]
        WrongType,
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Reset)
        }
    }

    fn resilience(minimum_requests: u32) -> Resilience {
        Resilience::new(
            "fake",
            CircuitBreakerConfig {
                minimum_requests,
                ..CircuitBreakerConfig::default()
            },
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                multiplier: 2.0,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let resilience = resilience(100);
        let calls = &AtomicU32::new(0);

        let value = resilience
            .call("get", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FakeError::Reset)
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let resilience = resilience(100);
        let calls = &AtomicU32::new(0);

        let err = resilience
            .call("get", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FakeError::Reset)
            })
            .await
            .expect_err("all attempts fail");

        assert!(matches!(err, ResilienceError::Failed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let resilience = resilience(1);
        let calls = &AtomicU32::new(0);

        let err = resilience
            .call("get", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FakeError::WrongType)
            })
            .await
            .expect_err("permanent failure");

        assert!(matches!(err, ResilienceError::Failed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resilience.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_calling() {
        let resilience = resilience(2);
        let _ = resilience
            .call("get", || async { Err::<(), _>(FakeError::Reset) })
            .await;
        assert_eq!(resilience.breaker().state(), CircuitState::Open);

        let calls = &AtomicU32::new(0);
        let err = resilience
            .call("get", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FakeError>(())
            })
            .await
            .expect_err("circuit is open");

        assert!(matches!(err, ResilienceError::CircuitOpen("get")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
