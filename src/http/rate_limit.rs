//! Rate limiting
//!
//! Two halves: a client-side token bucket (governor) that spaces out our own
//! requests, and [`RateLimitHint`], the server's view of our quota as read
//! from response headers.

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Reset values above this are epoch seconds rather than a delta
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

// ============================================================================
// Client-side throttle
// ============================================================================

/// Configuration for the client-side request throttle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Burst size (max tokens in bucket)
    pub burst_size: u32,
}

impl RateLimiterConfig {
    /// Throttle at `requests_per_second` with a burst of the same size
    pub fn per_second(requests_per_second: u32) -> Self {
        Self {
            requests_per_second,
            burst_size: requests_per_second,
        }
    }

    /// Set the burst size
    #[must_use]
    pub fn with_burst(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }
}

/// Token bucket shared by every request of a run
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<Governor<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>>,
}

impl RateLimiter {
    /// Create a limiter; zero rates are raised to one
    pub fn new(config: &RateLimiterConfig) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);

        Self {
            limiter: Arc::new(Governor::direct(Quota::per_second(rate).allow_burst(burst))),
        }
    }

    /// Wait until a request may be sent
    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit, returning immediately
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish()
    }
}

// ============================================================================
// Server hints
// ============================================================================

/// Throttling information advertised by the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitHint {
    /// `X-RateLimit-Remaining`
    pub remaining: Option<u64>,
    /// `Retry-After`, as a delay from now
    pub retry_after: Option<Duration>,
    /// `X-RateLimit-Reset`, as a delay from now
    pub reset_after: Option<Duration>,
}

impl RateLimitHint {
    /// Read the hint headers of a response
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_headers_at(headers, Utc::now())
    }

    /// Read the hint headers relative to `now`
    pub fn from_headers_at(headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        Self {
            remaining: header(RATE_LIMIT_REMAINING).and_then(|v| v.parse().ok()),
            retry_after: header(RETRY_AFTER.as_str()).and_then(|v| parse_retry_after(v, now)),
            reset_after: header(RATE_LIMIT_RESET).and_then(|v| parse_reset(v, now)),
        }
    }

    /// Check if the server reported an exhausted quota
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Parse a `Retry-After` value: delta seconds or an HTTP-date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let secs = value.parse::<u64>().ok()?;
    if secs < EPOCH_THRESHOLD {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)?;
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
