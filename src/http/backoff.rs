//! Retry backoff
//!
//! Exponential backoff with 10–30% jitter. Retry decisions live here and
//! nowhere else; the executor only asks.

use super::rate_limit::RateLimitHint;
use crate::error::ErrorKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Default base delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const JITTER_MIN: f64 = 0.10;
const JITTER_MAX: f64 = 0.30;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait this long, then retry
    Retry(Duration),
    /// Give up
    Stop,
}

/// Exponential backoff policy
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    max_retries: u32,
    rng: Mutex<StdRng>,
}

impl BackoffPolicy {
    /// Create a policy
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            max_retries,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed RNG seed so jitter is reproducible
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Retry budget
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide what to do before retry number `attempt` (1-based)
    pub fn next_delay(
        &self,
        attempt: u32,
        kind: ErrorKind,
        retry_after: Option<Duration>,
    ) -> Backoff {
        if !kind.is_retryable() || attempt > self.max_retries {
            return Backoff::Stop;
        }

        let computed = self.jittered(self.exponential(attempt));
        match (kind, retry_after) {
            (ErrorKind::RateLimited, Some(hint)) => Backoff::Retry(hint.max(computed)),
            _ => Backoff::Retry(computed),
        }
    }

    /// Pause to take before the next request when the server reports an
    /// exhausted quota on an otherwise successful response
    pub fn throttle_delay(&self, hint: &RateLimitHint) -> Option<Duration> {
        if !hint.is_exhausted() {
            return None;
        }
        let wait = hint.reset_after.or(hint.retry_after).unwrap_or(self.base);
        Some(wait.min(self.max_delay))
    }

    /// `base × 2^(attempt-1)`, capped at the ceiling
    fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let factor = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            rng.gen_range(JITTER_MIN..=JITTER_MAX)
        };
        delay.mul_f64(1.0 + factor).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES)
    }
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("base", &self.base)
            .field("max_delay", &self.max_delay)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
