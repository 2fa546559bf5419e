//! Token bucket admission gate.
//!
//! Tokens are refilled lazily whenever the bucket is inspected, based on the time elapsed since
//! the previous refill, so no background timer is needed. Waiters that find the bucket empty
//! sleep until the instant the next token is due and then compete for it again. There is no
//! fairness queue: whichever waiter the runtime polls first after a refill wins.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use config::shared::RateLimitConfig;
use tokio::time::Instant;

use crate::bail;
use crate::concurrency::cancel::CancelRx;
use crate::error::{ConveyorResult, ErrorKind};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket limiting how fast operations are admitted.
///
/// The bucket starts full. At most `capacity` acquisitions succeed back to back; afterwards one
/// more is admitted for every `1 / refill_rate_per_second` seconds that pass.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a full bucket from `config`.
    ///
    /// The config is expected to be validated, see [`RateLimitConfig::validate`].
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity);

        Self {
            capacity,
            refill_rate: config.refill_rate_per_second,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, sleeping until one is available.
    ///
    /// Fails with [`ErrorKind::Cancelled`] if cancellation fires first.
    pub async fn acquire(&self, cancel_rx: &CancelRx) -> ConveyorResult<()> {
        loop {
            if cancel_rx.is_cancelled() {
                bail!(ErrorKind::Cancelled, "Rate limiter acquire was cancelled");
            }

            let wait = match self.take_or_wait(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel_rx.wait_for_cancel() => {
                    bail!(ErrorKind::Cancelled, "Rate limiter acquire was cancelled");
                }
            }
        }
    }

    /// Takes one token if available, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait(Instant::now()).is_ok()
    }

    /// Returns the number of tokens currently available, including fractional ones.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());

        bucket.tokens
    }

    /// Takes a token at `now` or returns how long to wait until the next one is due.
    fn take_or_wait(&self, now: Instant) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        // Tiny refill rates overflow a duration, tokio saturates such a sleep to the far future.
        // Never sleep for zero, rounding could otherwise spin.
        let wait = Duration::try_from_secs_f64(missing / self.refill_rate)
            .unwrap_or(Duration::MAX)
            .max(Duration::from_millis(1));

        Err(wait)
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::concurrency::cancel::create_cancel_channel;

    #[tokio::test(start_paused = true)]
    async fn full_bucket_admits_burst_then_throttles() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let limiter = RateLimiter::new(&RateLimitConfig::new(3, 2.0));

        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        let start = Instant::now();
        limiter.acquire(&cancel_rx).await.unwrap();
        let waited = start.elapsed();

        assert!(waited >= Duration::from_millis(499), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(510), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_accrue_up_to_capacity() {
        let limiter = RateLimiter::new(&RateLimitConfig::new(2, 10.0));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(60)).await;

        assert!((limiter.available() - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn acquisitions_stay_within_bucket_bound() {
        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let capacity = 5;
        let rate = 10.0;
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::new(capacity, rate)));
        let acquired = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                let acquired = acquired.clone();
                let cancel_rx = cancel_rx.clone();
                tokio::spawn(async move {
                    while limiter.acquire(&cancel_rx).await.is_ok() {
                        acquired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let window = Duration::from_secs(2);
        tokio::time::sleep(window).await;
        let count = acquired.load(Ordering::SeqCst);
        cancel_tx.cancel();

        for worker in workers {
            worker.await.unwrap();
        }

        let bound = capacity as usize + (rate * window.as_secs_f64()).ceil() as usize;
        assert!(count <= bound, "{count} acquisitions exceed bound {bound}");
        assert!(count >= capacity as usize, "bucket should admit at least its burst");
    }

    #[tokio::test(start_paused = true)]
    async fn every_contending_waiter_is_served() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::new(1, 20.0)));
        let contenders = 8;

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let limiter = limiter.clone();
                let cancel_rx = cancel_rx.clone();
                tokio::spawn(async move {
                    for _ in 0..3 {
                        limiter.acquire(&cancel_rx).await.unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(60), handle)
                .await
                .expect("a waiter starved")
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn negligible_refill_rate_waits_until_cancelled() {
        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let config = RateLimitConfig::new(1, 1e-20);
        config.validate().unwrap();
        let limiter = Arc::new(RateLimiter::new(&config));

        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&cancel_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert!(!waiter.is_finished());
        cancel_tx.cancel();

        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_waiting_acquire() {
        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::new(1, 0.001)));
        assert!(limiter.try_acquire());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&cancel_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel_tx.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }
}
