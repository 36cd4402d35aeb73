//! Token-bucket bandwidth sharing.
//!
//! Two buckets exist per client: a CPU-side bucket throttling share
//! hashing (acquired from blocking walker threads) and a network-side
//! bucket shared by HTTP output and downloader input (acquired from
//! async tasks). Both are this one type.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A shared token bucket. A rate of zero means unlimited.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    bytes_per_sec: u64,
    /// Tokens currently available, capped at one second's worth.
    available: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> TokenBucket {
        TokenBucket {
            state: Mutex::new(BucketState {
                bytes_per_sec,
                available: bytes_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Change the rate. Takes effect on the next acquire.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut state = self.state.lock().unwrap();
        state.bytes_per_sec = bytes_per_sec;
        state.available = state.available.min(bytes_per_sec);
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().unwrap().bytes_per_sec
    }

    /// Take `bytes` tokens, returning how long the caller must wait
    /// first. Zero duration means the tokens were granted immediately.
    ///
    /// Requests larger than one second's budget are clamped to it, so a
    /// single huge buffer cannot stall a caller forever; per-buffer
    /// acquisitions are small in practice.
    fn take(&self, bytes: u64) -> Duration {
        let mut state = self.state.lock().unwrap();
        if state.bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let bytes = bytes.min(state.bytes_per_sec);

        // Refill for elapsed time.
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let refill = (elapsed.as_secs_f64() * state.bytes_per_sec as f64) as u64;
        if refill > 0 {
            state.available = (state.available + refill).min(state.bytes_per_sec);
            state.last_refill = now;
        }

        if state.available >= bytes {
            state.available -= bytes;
            Duration::ZERO
        } else {
            // Go into debt and tell the caller how long that debt takes
            // to pay off; this keeps long-run throughput at the rate.
            let deficit = bytes - state.available;
            state.available = 0;
            state.last_refill = now;
            Duration::from_secs_f64(deficit as f64 / state.bytes_per_sec as f64)
        }
    }

    /// Acquire from an async task.
    pub async fn acquire(&self, bytes: u64) {
        let wait = self.take(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Acquire from a blocking thread (the share walker).
    pub fn acquire_blocking(&self, bytes: u64) {
        let wait = self.take(bytes);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_waits() {
        let bucket = TokenBucket::new(0);
        for _ in 0..1000 {
            assert_eq!(bucket.take(1 << 30), Duration::ZERO);
        }
    }

    #[test]
    fn burst_then_throttle() {
        let bucket = TokenBucket::new(1000);
        // The initial second of budget is free.
        assert_eq!(bucket.take(1000), Duration::ZERO);
        // The next request must wait roughly its own duration.
        let wait = bucket.take(500);
        assert!(wait > Duration::from_millis(400), "wait was {:?}", wait);
        assert!(wait <= Duration::from_millis(600), "wait was {:?}", wait);
    }

    #[test]
    fn oversized_requests_are_clamped() {
        let bucket = TokenBucket::new(100);
        assert_eq!(bucket.take(100), Duration::ZERO);
        // 10 seconds worth, clamped to 1 second worth of debt.
        let wait = bucket.take(1000);
        assert!(wait <= Duration::from_millis(1100), "wait was {:?}", wait);
    }

    #[test]
    fn refill_restores_budget() {
        let bucket = TokenBucket::new(100_000);
        assert_eq!(bucket.take(100_000), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(200));
        // ~20k tokens refilled.
        assert_eq!(bucket.take(10_000), Duration::ZERO);
    }

    #[test]
    fn rate_change_applies() {
        let bucket = TokenBucket::new(100);
        bucket.set_rate(1_000_000);
        assert_eq!(bucket.rate(), 1_000_000);
        // Available was capped at the old rate; the refill grows it.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(bucket.take(10_000), Duration::ZERO);
    }

    #[tokio::test]
    async fn async_acquire_completes() {
        let bucket = TokenBucket::new(1_000_000);
        bucket.acquire(100).await;
        bucket.acquire(100).await;
    }
}
