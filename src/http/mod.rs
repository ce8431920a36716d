//! HTTP module
//!
//! Everything between a page request and the wire.
//!
//! # Features
//!
//! - **Request execution**: bearer auth, one re-authentication on 401,
//!   error classification
//! - **Backoff**: exponential with jitter, `Retry-After` aware
//! - **Rate limiting**: server quota hints plus an optional client-side
//!   token bucket using governor

mod backoff;
mod executor;
mod rate_limit;

pub use backoff::{
    Backoff, BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
};
pub use executor::{
    build_client, ExecutorStats, RequestExecutor, DEFAULT_REQUEST_TIMEOUT, USER_AGENT,
};
pub use rate_limit::{parse_retry_after, RateLimitHint, RateLimiter, RateLimiterConfig};
