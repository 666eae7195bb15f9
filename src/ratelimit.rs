//! Per-project token-bucket rate limiting.
//!
//! Buckets are created lazily on the first request that names a project and
//! are kept for the life of the process. `allow` never waits: a request
//! either takes a token immediately or is refused.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct TokenBucket {
    /// Maximum tokens in the bucket (= burst capacity).
    capacity: u32,
    /// Current available tokens.
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time tokens were refilled.
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Rate limiter covering every project seen by the service.
pub struct Limiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    refill_rate: f64,
    burst: u32,
    requests_per_hour: u32,
}

impl Limiter {
    /// `requests_per_hour` is the sustained allowance per project;
    /// `burst` is how many requests may land at once.
    pub fn new(requests_per_hour: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            refill_rate: f64::from(requests_per_hour) / 3600.0,
            burst,
            requests_per_hour,
        }
    }

    /// The configured hourly limit, for response headers.
    pub fn limit(&self) -> u32 {
        self.requests_per_hour
    }

    /// Try to consume one token for the project. Never blocks.
    pub fn allow(&self, project_id: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(project_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst, self.refill_rate))
            .try_consume()
    }

    /// Current token count for the project, for response headers.
    pub fn tokens(&self, project_id: &str) -> f64 {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(project_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst, self.refill_rate))
            .available()
    }
}
