//! Auth types
//!
//! Client credentials, the cache key they map to, and the issued token.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;

/// Scope requested when neither an explicit scope nor an audience is configured
pub const DEFAULT_SCOPE: &str = "urn:opc:resource:consumer::all";

/// OAuth2 client-credentials configuration
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Client ID
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Token endpoint URL
    pub token_url: String,
    /// Audience (IDCS resource URL)
    pub audience: Option<String>,
    /// Explicit scope override
    pub scope: Option<String>,
}

impl ClientCredentials {
    /// Create credentials for a token endpoint
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            audience: None,
            scope: None,
        }
    }

    /// Set the audience
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Set an explicit scope
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Scope sent in the token request body
    pub fn requested_scope(&self) -> &str {
        self.scope
            .as_deref()
            .or(self.audience.as_deref())
            .unwrap_or(DEFAULT_SCOPE)
    }

    /// Key under which tokens for these credentials are cached
    pub fn cache_key(&self) -> TokenCacheKey {
        TokenCacheKey {
            client_id: self.client_id.clone(),
            token_url: self.token_url.clone(),
            audience: self.audience.clone(),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .field("audience", &self.audience)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Identity of a cached token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenCacheKey {
    pub client_id: String,
    pub token_url: String,
    pub audience: Option<String>,
}

/// An issued bearer token. Never mutated; a refresh produces a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    token_type: String,
    scope: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Token {
    /// Create a token
    pub fn new(
        value: impl Into<String>,
        token_type: impl Into<String>,
        scope: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            value: value.into(),
            token_type: token_type.into(),
            scope: scope.into(),
            issued_at: Utc::now(),
            expires_at,
        }
    }

    /// The bearer value
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Token type reported by the server (usually "Bearer")
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Scope the token was issued for
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Expiry instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Check if the token is expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check if the token expires within `margin` of `now`
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now + margin >= self.expires_at
    }

    /// Instant after which a cache should replace this token: `margin`
    /// before expiry, but never before half its lifetime has passed
    pub fn refresh_at(&self, margin: Duration) -> DateTime<Utc> {
        let half_life = ((self.expires_at - self.issued_at) / 2).max(Duration::zero());
        self.expires_at - margin.min(half_life)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token endpoint response body
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}
