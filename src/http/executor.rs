//! Request executor
//!
//! Issues page requests against the OIC REST API. Each call walks
//! `Authenticating -> Requesting -> (Success | Retrying -> Requesting |
//! PermanentFailure)`:
//!
//! - token failures other than rejected credentials are retried like
//!   transport failures
//! - a 401 invalidates the token and re-authenticates once, outside the
//!   retry budget
//! - 429, 5xx, timeouts and connection failures go through the
//!   [`BackoffPolicy`]
//! - any other 4xx, or an unparseable 2xx body, fails immediately
//!
//! Every wait races the caller's [`CancellationToken`].

use super::backoff::{Backoff, BackoffPolicy};
use super::rate_limit::{RateLimitHint, RateLimiter};
use crate::auth::TokenManager;
use crate::error::{ErrorKind, FetchError, Result};
use crate::pagination::{PageRequest, PageResult};
use crate::types::JsonValue;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// User agent sent on every request
pub const USER_AGENT: &str = concat!("oic-extract/", env!("CARGO_PKG_VERSION"));

const MAX_ERROR_BODY: usize = 512;

/// Build the HTTP client shared by the executor and the token manager
pub fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of executor activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// HTTP requests sent to resource endpoints
    pub requests: u64,
    /// Retries scheduled through the backoff policy
    pub retries: u64,
    /// Re-authentications after a 401
    pub reauths: u64,
    /// Requests that timed out
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    requests: AtomicU64,
    retries: AtomicU64,
    reauths: AtomicU64,
    timeouts: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reauths: self.reauths.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// A failed attempt that may be retried
struct AttemptFailure {
    kind: ErrorKind,
    status: Option<u16>,
    retry_after: Option<Duration>,
    message: String,
}

/// Page request executor
pub struct RequestExecutor {
    client: Client,
    base_url: Url,
    tokens: Arc<TokenManager>,
    backoff: BackoffPolicy,
    rate_limiter: Option<RateLimiter>,
    throttled_until: Mutex<Option<Instant>>,
    stats: StatsCounters,
}

impl RequestExecutor {
    /// Create an executor
    pub fn new(
        client: Client,
        base_url: Url,
        tokens: Arc<TokenManager>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            base_url,
            tokens,
            backoff,
            rate_limiter: None,
            throttled_until: Mutex::new(None),
            stats: StatsCounters::default(),
        }
    }

    /// Throttle outgoing requests client-side
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// The token manager in use
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Activity counters
    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot()
    }

    /// Resolve a resource path against the base URL
    pub fn url_for(&self, path: &str) -> Result<Url> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        Ok(base.join(path.trim_start_matches('/'))?)
    }

    /// Fetch one page
    pub async fn execute(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<PageResult, FetchError> {
        let resource = request.resource.as_str();
        let url = self.url_for(&request.path).map_err(|e| {
            FetchError::new(ErrorKind::ClientError, resource, 0, e.to_string())
        })?;
        let query = request.query_pairs();

        let mut attempts: u32 = 0;
        let mut retries: u32 = 0;
        let mut timeouts: u32 = 0;
        let mut reauthenticated = false;

        loop {
            self.wait_for_throttle(resource, attempts, cancel).await?;

            // Authenticating
            let token = match race(cancel, self.tokens.get_valid_token()).await {
                None => return Err(cancelled(resource, attempts)),
                Some(Ok(token)) => token,
                Some(Err(e)) => {
                    let kind = ErrorKind::from(e.kind);
                    let failure = AttemptFailure {
                        kind,
                        status: None,
                        retry_after: None,
                        message: e.message,
                    };
                    retries += 1;
                    self.back_off(resource, attempts, retries, failure, cancel).await?;
                    continue;
                }
            };

            // Requesting
            if let Some(limiter) = &self.rate_limiter {
                if race(cancel, limiter.wait()).await.is_none() {
                    return Err(cancelled(resource, attempts));
                }
            }

            attempts += 1;
            StatsCounters::bump(&self.stats.requests);
            debug!(resource, url = %url, attempt = attempts, "GET page");

            let sent = race(
                cancel,
                self.client
                    .get(url.clone())
                    .bearer_auth(token.value())
                    .query(&query)
                    .send(),
            )
            .await;

            let failure = match sent {
                None => return Err(cancelled(resource, attempts)),
                Some(Err(e)) => self.transport_failure(&e, &mut timeouts),
                Some(Ok(response)) => {
                    let status = response.status();
                    let hint = RateLimitHint::from_headers(response.headers());

                    if status.is_success() {
                        let body = match race(cancel, response.bytes()).await {
                            None => return Err(cancelled(resource, attempts)),
                            Some(Ok(body)) => body,
                            Some(Err(e)) => {
                                let failure = self.transport_failure(&e, &mut timeouts);
                                retries += 1;
                                self.back_off(resource, attempts, retries, failure, cancel)
                                    .await?;
                                continue;
                            }
                        };

                        let mut page = serde_json::from_slice::<JsonValue>(&body)
                            .map_err(|e| e.to_string())
                            .and_then(|value| PageResult::from_body(request, value))
                            .map_err(|message| {
                                FetchError::new(
                                    ErrorKind::MalformedResponse,
                                    resource,
                                    attempts,
                                    message,
                                )
                                .with_status(status.as_u16())
                            })?;

                        if let Some(pause) = self.backoff.throttle_delay(&hint) {
                            debug!(
                                resource,
                                pause_ms = pause.as_millis() as u64,
                                "Quota exhausted, pausing"
                            );
                            self.set_throttle(pause);
                        }
                        page.rate_limit = hint;
                        page.timeouts = timeouts;
                        return Ok(page);
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        if reauthenticated {
                            return Err(FetchError::new(
                                ErrorKind::Unauthorized,
                                resource,
                                attempts,
                                "rejected again after re-authentication",
                            )
                            .with_status(401));
                        }
                        reauthenticated = true;
                        StatsCounters::bump(&self.stats.reauths);
                        warn!(resource, "Got 401, refreshing token");
                        self.tokens.invalidate(&token).await;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    AttemptFailure {
                        kind: ErrorKind::from_status(status.as_u16()),
                        status: Some(status.as_u16()),
                        retry_after: hint.retry_after,
                        message: format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            body.chars().take(MAX_ERROR_BODY).collect::<String>()
                        ),
                    }
                }
            };

            retries += 1;
            self.back_off(resource, attempts, retries, failure, cancel).await?;
        }
    }

    /// Consult the backoff policy; sleep on `Retry`, fail on `Stop`
    async fn back_off(
        &self,
        resource: &str,
        attempts: u32,
        retry: u32,
        failure: AttemptFailure,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), FetchError> {
        match self.backoff.next_delay(retry, failure.kind, failure.retry_after) {
            Backoff::Stop => {
                let mut err = FetchError::new(failure.kind, resource, attempts, failure.message);
                err.http_status = failure.status;
                warn!(resource, kind = %failure.kind, attempts, "Giving up on page");
                Err(err)
            }
            Backoff::Retry(delay) => {
                StatsCounters::bump(&self.stats.retries);
                warn!(
                    resource,
                    kind = %failure.kind,
                    status = failure.status,
                    retry,
                    max_retries = self.backoff.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying page"
                );
                match race(cancel, tokio::time::sleep(delay)).await {
                    Some(()) => Ok(()),
                    None => Err(cancelled(resource, attempts)),
                }
            }
        }
    }

    fn transport_failure(&self, error: &reqwest::Error, timeouts: &mut u32) -> AttemptFailure {
        let kind = if error.is_timeout() {
            *timeouts += 1;
            StatsCounters::bump(&self.stats.timeouts);
            ErrorKind::Timeout
        } else {
            ErrorKind::NetworkFailure
        };
        AttemptFailure {
            kind,
            status: error.status().map(|s| s.as_u16()),
            retry_after: None,
            message: error.to_string(),
        }
    }

    fn set_throttle(&self, pause: Duration) {
        let until = Instant::now() + pause;
        let mut slot = self
            .throttled_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.map_or(true, |current| current < until) {
            *slot = Some(until);
        }
    }

    async fn wait_for_throttle(
        &self,
        resource: &str,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), FetchError> {
        let until = *self
            .throttled_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match until {
            Some(until) if until > Instant::now() => {
                match race(cancel, tokio::time::sleep_until(until)).await {
                    Some(()) => Ok(()),
                    None => Err(cancelled(resource, attempts)),
                }
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("base_url", &self.base_url.as_str())
            .field("backoff", &self.backoff)
            .field("has_rate_limiter", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

/// Run `future` unless `cancel` fires first
async fn race<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

fn cancelled(resource: &str, attempts: u32) -> FetchError {
    FetchError::new(ErrorKind::Cancelled, resource, attempts, "extraction cancelled")
}
