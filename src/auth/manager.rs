//! Token manager
//!
//! Acquires OAuth2 client-credentials tokens, caches one per
//! `(client_id, token_url, audience)` and refreshes them ahead of expiry.
//!
//! Refreshes are single-flight per cache key: the first caller to find the
//! cached token missing or expiring takes the key's refresh lock and performs
//! the exchange. Callers queued on that lock take its outcome once it is
//! released: the fresh token from the cache, or the same error.

use super::types::{ClientCredentials, Token, TokenCacheKey, TokenResponse};
use crate::error::{AuthError, AuthErrorKind};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Refresh this long before the server-reported expiry
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token response omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Longest slice of an error body kept in messages
const MAX_ERROR_BODY: usize = 256;

#[derive(Default)]
struct TokenSlot {
    current: RwLock<Option<Arc<Token>>>,
    refresh: Mutex<LastExchange>,
    /// Mirror of `LastExchange::generation`, readable without the lock
    generation: AtomicU64,
}

/// Outcome of the most recent exchange of a slot
#[derive(Default)]
struct LastExchange {
    generation: u64,
    failure: Option<AuthError>,
}

impl TokenSlot {
    async fn usable(&self, margin: chrono::Duration) -> Option<Arc<Token>> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|t| Utc::now() < t.refresh_at(margin))
            .cloned()
    }
}

/// Caching, single-flight OAuth2 token source
pub struct TokenManager {
    /// Credentials used by [`TokenManager::get_valid_token`]
    credentials: ClientCredentials,
    /// HTTP client for token requests
    http_client: Client,
    /// Proactive refresh margin
    refresh_margin: chrono::Duration,
    /// One slot per cache key
    slots: Mutex<HashMap<TokenCacheKey, Arc<TokenSlot>>>,
    /// Token exchanges performed
    exchanges: AtomicU64,
}

impl TokenManager {
    /// Create a token manager with its own HTTP client
    pub fn new(credentials: ClientCredentials) -> Self {
        Self::with_client(credentials, Client::new())
    }

    /// Create a token manager sharing an existing HTTP client
    pub fn with_client(credentials: ClientCredentials, http_client: Client) -> Self {
        Self {
            credentials,
            http_client,
            refresh_margin: to_chrono(DEFAULT_REFRESH_MARGIN),
            slots: Mutex::new(HashMap::new()),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Set the proactive refresh margin
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = to_chrono(margin);
        self
    }

    /// Get the configured credentials
    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    /// Number of token exchanges performed so far
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Get a token for the configured credentials, refreshing if necessary
    pub async fn get_valid_token(&self) -> Result<Arc<Token>, AuthError> {
        self.token_for(&self.credentials).await
    }

    /// Get a token for arbitrary credentials, refreshing if necessary
    pub async fn token_for(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<Arc<Token>, AuthError> {
        let slot = self.slot(&credentials.cache_key()).await;

        let seen = slot.generation.load(Ordering::Acquire);
        if let Some(token) = slot.usable(self.refresh_margin).await {
            return Ok(token);
        }

        let mut last = slot.refresh.lock().await;

        // Whoever held the lock before us may already have refreshed
        if let Some(token) = slot.usable(self.refresh_margin).await {
            debug!(client_id = %credentials.client_id, "Token refreshed by concurrent caller");
            return Ok(token);
        }
        if last.generation != seen {
            if let Some(failure) = &last.failure {
                debug!(client_id = %credentials.client_id, "Sharing failed exchange with waiter");
                return Err(failure.clone());
            }
        }

        let outcome = self.exchange(credentials).await.map(Arc::new);
        if let Ok(token) = &outcome {
            *slot.current.write().await = Some(Arc::clone(token));
        }
        last.generation += 1;
        last.failure = outcome.as_ref().err().cloned();
        slot.generation.store(last.generation, Ordering::Release);
        outcome
    }

    /// Drop the cached token for the configured credentials if it is still
    /// `stale`. A newer token cached in the meantime is kept.
    pub async fn invalidate(&self, stale: &Token) {
        let slot = self.slot(&self.credentials.cache_key()).await;
        let mut current = slot.current.write().await;
        if current.as_deref() == Some(stale) {
            debug!(client_id = %self.credentials.client_id, "Invalidated cached token");
            *current = None;
        }
    }

    /// Clear every cached token
    pub async fn clear_cache(&self) {
        let slots = self.slots.lock().await;
        for slot in slots.values() {
            *slot.current.write().await = None;
        }
    }

    async fn slot(&self, key: &TokenCacheKey) -> Arc<TokenSlot> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Perform a client-credentials exchange
    async fn exchange(&self, credentials: &ClientCredentials) -> Result<Token, AuthError> {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        let scope = credentials.requested_scope();

        let form = [("grant_type", "client_credentials"), ("scope", scope)];
        let response = self
            .http_client
            .post(&credentials.token_url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                warn!(token_url = %credentials.token_url, "Token endpoint unreachable");
                AuthError::new(
                    AuthErrorKind::NetworkFailure,
                    format!("token endpoint unreachable: {e}"),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AuthErrorKind::InvalidCredentials
                }
                _ => AuthErrorKind::ServerRejected,
            };
            warn!(
                status = status.as_u16(),
                client_id = %credentials.client_id,
                "Token request rejected"
            );
            return Err(AuthError::new(
                kind,
                format!(
                    "token endpoint returned {}: {}",
                    status.as_u16(),
                    truncate(&body, MAX_ERROR_BODY)
                ),
            ));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            AuthError::new(
                AuthErrorKind::ServerRejected,
                format!("malformed token response: {e}"),
            )
        })?;

        if body.access_token.is_empty() {
            return Err(AuthError::new(
                AuthErrorKind::ServerRejected,
                "token response carried an empty access_token",
            ));
        }

        let lifetime = body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        if lifetime <= 0 {
            return Err(AuthError::new(
                AuthErrorKind::ServerRejected,
                format!("token issued already expired (expires_in={lifetime})"),
            ));
        }

        let token = Token::new(
            body.access_token,
            body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope,
            Utc::now() + chrono::Duration::seconds(lifetime),
        );

        info!(
            client_id = %credentials.client_id,
            scope = %scope,
            expires_in = lifetime,
            "Acquired OAuth2 access token"
        );

        Ok(token)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("credentials", &self.credentials)
            .field("refresh_margin", &self.refresh_margin)
            .field("exchanges", &self.exchange_count())
            .finish_non_exhaustive()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn truncate(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}
