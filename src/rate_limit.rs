//! Token-bucket admission control
//!
//! Tokens are tracked in thousandths so fractional refill rates accrue
//! without drift. Both counters are plain atomics updated with CAS loops;
//! nothing here ever blocks or awaits.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

const MILLI_TOKENS: u64 = 1_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_milli_per_sec: u64,
    tokens_milli: AtomicU64,
    last_refill_nanos: AtomicU64,
    origin: Instant,
}

impl TokenBucket {
    /// A full bucket of `capacity` tokens refilled at `refill_per_second`.
    ///
    /// A non-positive or non-finite rate disables refill entirely.
    pub fn new(capacity: u64, refill_per_second: f64) -> Self {
        let refill_milli_per_sec = if refill_per_second.is_finite() && refill_per_second > 0.0 {
            (refill_per_second * MILLI_TOKENS as f64).round() as u64
        } else {
            0
        };

        Self {
            capacity,
            refill_milli_per_sec,
            tokens_milli: AtomicU64::new(capacity.saturating_mul(MILLI_TOKENS)),
            last_refill_nanos: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    /// Takes one token if available. Never waits.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        self.tokens_milli
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(MILLI_TOKENS)
            })
            .is_ok()
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens_milli.load(Ordering::Acquire) / MILLI_TOKENS
    }

    fn refill(&self) {
        if self.refill_milli_per_sec == 0 {
            return;
        }

        let now = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let rate = u128::from(self.refill_milli_per_sec);
        let mut last = self.last_refill_nanos.load(Ordering::Acquire);

        loop {
            if now <= last {
                return;
            }

            let elapsed = u128::from(now - last);
            let credit = elapsed * rate / NANOS_PER_SEC;
            if credit == 0 {
                return;
            }
            // only the time that produced whole milli-tokens is consumed
            let consumed = (credit * NANOS_PER_SEC / rate) as u64;

            match self.last_refill_nanos.compare_exchange_weak(
                last,
                last + consumed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let ceiling = self.capacity.saturating_mul(MILLI_TOKENS);
                    let credit = u64::try_from(credit).unwrap_or(u64::MAX);
                    let _ = self.tokens_milli.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |tokens| Some(ceiling.min(tokens.saturating_add(credit))),
                    );
                    return;
                }
                Err(actual) => last = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::TokenBucket;

    #[tokio::test(start_paused = true)]
    async fn zero_refill_exhausts_after_capacity() {
        let bucket = TokenBucket::new(5, 0.0);

        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn one_refill_interval_grants_exactly_one_token() {
        let bucket = TokenBucket::new(5, 1.0);

        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(3, 10.0);
        assert!(bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(bucket.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_intervals_accumulate() {
        let bucket = TokenBucket::new(1, 2.0);
        assert!(bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!bucket.try_acquire());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test]
    async fn concurrent_acquires_never_overdraw() {
        let bucket = Arc::new(TokenBucket::new(50, 0.0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let bucket = Arc::clone(&bucket);
            handles.push(tokio::spawn(async move {
                (0..20).filter(|_| bucket.try_acquire()).count()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            granted += handle.await.expect("task completes");
        }
        assert_eq!(granted, 50);
    }
}
