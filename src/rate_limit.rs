use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::CallContext;
use crate::util::lock_unpoisoned;

pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'a>>;

/// Admission control run once per `execute` call, before the pre-send chain.
pub trait RateLimiter: Send + Sync {
    /// Resolves when the call may proceed. Must give up with the context error
    /// as soon as `context` finishes.
    fn wait<'a>(&'a self, context: &'a CallContext) -> WaitFuture<'a>;
}

/// Admits every call immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn wait<'a>(&'a self, context: &'a CallContext) -> WaitFuture<'a> {
        Box::pin(async move {
            match context.err() {
                Some(error) => Err(error.into()),
                None => Ok(()),
            }
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimit {
    requests_per_second: f64,
    burst: usize,
}

impl RateLimit {
    pub fn new(requests_per_second: f64, burst: usize) -> Self {
        Self::standard()
            .requests_per_second(requests_per_second)
            .burst(burst)
    }

    pub const fn standard() -> Self {
        Self {
            requests_per_second: 50.0,
            burst: 50,
        }
    }

    pub fn requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };
        self
    }

    pub const fn burst(mut self, burst: usize) -> Self {
        self.burst = if burst == 0 { 1 } else { burst };
        self
    }

    pub fn configured_requests_per_second(self) -> f64 {
        self.requests_per_second
    }

    pub fn configured_burst(self) -> usize {
        self.burst
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            tokens: limit.configured_burst() as f64,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        let replenished = elapsed_secs * self.limit.configured_requests_per_second();
        self.tokens = (self.tokens + replenished).min(self.limit.configured_burst() as f64);
    }

    /// Takes a token when one is available, otherwise returns how long until one is.
    fn try_acquire(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Duration::ZERO;
        }
        let needed_tokens = (1.0 - self.tokens).max(0.0);
        let delay_secs = needed_tokens / self.limit.configured_requests_per_second();
        if delay_secs <= f64::EPSILON {
            Duration::from_millis(1)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

/// Client-wide token bucket: `burst` calls at once, refilled at `requests_per_second`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    bucket: Mutex<TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(limit, Instant::now())),
        }
    }

    fn acquire_delay(&self) -> Duration {
        lock_unpoisoned(&self.bucket).try_acquire(Instant::now())
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn wait<'a>(&'a self, context: &'a CallContext) -> WaitFuture<'a> {
        Box::pin(async move {
            loop {
                if let Some(error) = context.err() {
                    return Err(error.into());
                }
                let delay = self.acquire_delay();
                if delay.is_zero() {
                    return Ok(());
                }
                context.sleep(delay).await?;
            }
        })
    }
}
