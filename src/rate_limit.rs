//! Token buckets for the chat turn routes, one per bearer token.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Mutex;

const IDLE_BUCKET_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Bucket size, the most requests a client can make back to back.
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
}

impl RateLimitDecision {
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in [
            ("x-ratelimit-limit", u64::from(self.limit)),
            ("x-ratelimit-remaining", u64::from(self.remaining)),
            ("x-ratelimit-reset", self.reset_seconds),
        ] {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    burst: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// `burst` is the bucket size; tokens come back at `per_minute`.
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            per_minute: per_minute.max(1),
            burst: burst.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let refill_per_sec = f64::from(self.per_minute) / 60.0;
        let capacity = f64::from(self.burst);

        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < IDLE_BUCKET_TTL);

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let deficit = (1.0 - bucket.tokens).max(0.0);
        RateLimitDecision {
            allowed,
            limit: self.burst,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_seconds: (deficit / refill_per_sec).ceil() as u64,
        }
    }
}
