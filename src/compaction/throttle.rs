use std::time::{Duration, Instant};

/// Token bucket over bytes written by compaction.
///
/// Tokens refill continuously at `bytes_per_sec` up to `burst`. Asking for
/// more than is available sleeps the compaction thread until the bucket has
/// refilled enough, which keeps background writes under the configured
/// bandwidth without touching foreground paths.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    burst: u64,
    tokens: f64,
    last_refill: Instant,
    total_throttled: Duration,
}

impl RateLimiter {
    /// Burst defaults to one second's worth of bytes.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self::with_burst(bytes_per_sec, bytes_per_sec)
    }

    pub fn with_burst(bytes_per_sec: u64, burst: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        let burst = burst.max(1);
        RateLimiter {
            bytes_per_sec,
            burst,
            tokens: burst as f64,
            last_refill: Instant::now(),
            total_throttled: Duration::ZERO,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec as f64).min(self.burst as f64);
        self.last_refill = now;
    }

    /// Take `bytes` tokens without waiting. False if the bucket is short.
    pub fn try_acquire(&mut self, bytes: u64) -> bool {
        self.refill();
        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Take `bytes` tokens, sleeping until they are available.
    /// Requests larger than the burst go into debt and are paid off by the
    /// wait. Returns how long this call slept.
    pub fn acquire(&mut self, bytes: u64) -> Duration {
        self.refill();
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }

        let wait = Duration::from_secs_f64(-self.tokens / self.bytes_per_sec as f64);
        std::thread::sleep(wait);
        self.refill();
        self.total_throttled += wait;
        wait
    }

    /// Tokens currently available, rounded down.
    pub fn available(&mut self) -> u64 {
        self.refill();
        self.tokens.max(0.0) as u64
    }

    /// Total time spent sleeping in `acquire`.
    pub fn total_throttled(&self) -> Duration {
        self.total_throttled
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }
}
