use std::collections::HashMap;
use std::time::Instant;

/// Single-threaded token bucket: refills continuously at `rate` tokens/second, capped at
/// `rate` (no burst beyond one second's worth). Lives inside one worker's `Rc<RefCell<..>>`,
/// so no atomics are needed.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: u32) -> Self {
        Self { tokens: rate as f64, last_refill: Instant::now() }
    }

    fn try_take(&mut self, rate: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// System-wide and per-key (client IP + destination) rate limiting. A `rate` of 0 means
/// unlimited and is never consulted.
pub struct RateLimiter {
    system_rate: u32,
    system_bucket: Bucket,
    user_rate: u32,
    user_buckets: HashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(system_rate: u32, user_rate: u32) -> Self {
        Self {
            system_rate,
            system_bucket: Bucket::new(system_rate.max(1)),
            user_rate,
            user_buckets: HashMap::new(),
        }
    }

    pub fn allow_system(&mut self) -> bool {
        if self.system_rate == 0 {
            return true;
        }
        self.system_bucket.try_take(self.system_rate)
    }

    pub fn allow_user(&mut self, key: &str) -> bool {
        if self.user_rate == 0 {
            return true;
        }
        let rate = self.user_rate;
        let bucket = self.user_buckets.entry(key.to_string()).or_insert_with(|| Bucket::new(rate));
        bucket.try_take(rate)
    }
}
