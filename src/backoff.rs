use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::RETRY_AFTER;
use rand::Rng;

/// Maps a retry index and the last response's headers to a wait duration.
///
/// `attempt_index` is 0 for the first retry. Implementations must return a value in
/// `[min_wait, max_wait]`.
pub trait Backoff: Send + Sync {
    fn wait(
        &self,
        min_wait: Duration,
        max_wait: Duration,
        attempt_index: usize,
        response_headers: Option<&HeaderMap>,
    ) -> Duration;
}

/// Exponential growth from `min_wait`, doubling per retry, capped at `max_wait`.
///
/// A `Retry-After` header on the last response overrides the computed value and is
/// clamped to the same window. No jitter is applied.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExponentialBackoff;

impl Backoff for ExponentialBackoff {
    fn wait(
        &self,
        min_wait: Duration,
        max_wait: Duration,
        attempt_index: usize,
        response_headers: Option<&HeaderMap>,
    ) -> Duration {
        let max_wait = max_wait.max(min_wait);
        let hint = response_headers.and_then(|headers| parse_retry_after(headers, SystemTime::now()));
        if let Some(hint) = hint {
            return hint.clamp(min_wait, max_wait);
        }
        exponential_delay(min_wait, max_wait, attempt_index)
    }
}

pub(crate) fn exponential_delay(
    min_wait: Duration,
    max_wait: Duration,
    attempt_index: usize,
) -> Duration {
    let capped_exponent = attempt_index.min(31) as u32;
    let multiplier = 1_u32 << capped_exponent;
    min_wait
        .checked_mul(multiplier)
        .unwrap_or(max_wait)
        .min(max_wait)
}

/// Wraps another backoff and spreads each wait by `±ratio`, never leaving the window.
#[derive(Clone, Debug)]
pub struct JitteredBackoff<B = ExponentialBackoff> {
    inner: B,
    ratio: f64,
}

impl JitteredBackoff<ExponentialBackoff> {
    pub fn exponential(ratio: f64) -> Self {
        Self::new(ExponentialBackoff, ratio)
    }
}

impl<B> JitteredBackoff<B> {
    pub fn new(inner: B, ratio: f64) -> Self {
        Self {
            inner,
            ratio: if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 },
        }
    }
}

impl<B: Backoff> Backoff for JitteredBackoff<B> {
    fn wait(
        &self,
        min_wait: Duration,
        max_wait: Duration,
        attempt_index: usize,
        response_headers: Option<&HeaderMap>,
    ) -> Duration {
        let base = self
            .inner
            .wait(min_wait, max_wait, attempt_index, response_headers);
        if self.ratio <= f64::EPSILON {
            return base;
        }

        let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
        if base_ms <= 1 {
            return base;
        }
        let span = ((base_ms as f64) * self.ratio).round().max(1.0) as u64;
        let low = base_ms.saturating_sub(span);
        let high = base_ms.saturating_add(span).max(low);
        let sampled = Duration::from_millis(rand::rng().random_range(low..=high));
        sampled.clamp(min_wait, max_wait.max(min_wait))
    }
}

/// Reads `Retry-After` as delay-seconds or an HTTP-date relative to `now`.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}
