//! Byte-rate limiting for snapshot transfers
//!
//! Token bucket holding at most one second worth of bytes. Callers await
//! `acquire(n)` before consuming `n` bytes from the network.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket refilled continuously at `refill_rate` tokens per second
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    burst_size: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(burst_size: f64, refill_rate: f64) -> Self {
        Self {
            tokens: burst_size,
            last_refill: Instant::now(),
            burst_size,
            refill_rate,
        }
    }

    /// Try to consume `n` tokens. Returns true if allowed.
    fn try_consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.burst_size);
        self.last_refill = now;
    }

    /// Get time until `n` tokens are available
    fn retry_after(&self, n: f64) -> Duration {
        if self.tokens >= n {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((n - self.tokens) / self.refill_rate)
        }
    }
}

/// Async byte-rate limiter, unlimited when created with a zero rate
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Create a limiter allowing `bytes_per_second`, 0 means unlimited
    pub fn new(bytes_per_second: u64) -> Self {
        let bucket = (bytes_per_second > 0).then(|| {
            let rate = bytes_per_second as f64;
            Mutex::new(TokenBucket::new(rate, rate))
        });
        Self { bucket }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Wait until `n` bytes may be consumed
    pub async fn acquire(&self, n: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let mut remaining = n as f64;
        while remaining > 0.0 {
            let wait = {
                let mut bucket = bucket.lock().unwrap();
                // chunks larger than the burst are paid for in burst-sized steps
                let step = remaining.min(bucket.burst_size);
                if bucket.try_consume(step) {
                    remaining -= step;
                    Duration::ZERO
                } else {
                    bucket.retry_after(step)
                }
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket() {
        let mut bucket = TokenBucket::new(10.0, 1.0);

        // Should allow burst
        for _ in 0..10 {
            assert!(bucket.try_consume(1.0));
        }

        // Should be rate limited
        assert!(!bucket.try_consume(1.0));
        assert!(bucket.retry_after(1.0) > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unlimited_does_not_wait() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.is_limited());

        let start = Instant::now();
        limiter.acquire(100 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_limiter_throttles() {
        let limiter = RateLimiter::new(1_000);

        let start = Instant::now();
        // first second worth is the burst, the next 500 bytes take ~500ms
        limiter.acquire(1_000).await;
        limiter.acquire(500).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
