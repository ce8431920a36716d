//! Error types for the OIC extraction engine
//!
//! This module defines the error hierarchy for the entire crate.
//! All public APIs return `Result<T, Error>` where Error is defined here.
//!
//! Two failure classes get dedicated structs because callers branch on them:
//! [`AuthError`] (token exchange) and [`FetchError`] (a resource page request
//! that exhausted its retry budget or failed permanently).

use serde::Serialize;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error kinds
// ============================================================================

/// Failure classes of an OAuth2 client-credentials exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    /// Token endpoint rejected the client id/secret (fatal)
    InvalidCredentials,
    /// Token endpoint unreachable
    NetworkFailure,
    /// Non-2xx other than a credentials rejection, or a malformed response
    ServerRejected,
}

impl AuthErrorKind {
    /// Machine-readable name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::NetworkFailure => "network_failure",
            Self::ServerRejected => "server_rejected",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed request, used for retry decisions and
/// reported as the kind of a [`FetchError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    ServerRejected,
    /// Request timed out
    Timeout,
    /// Connection-level failure
    NetworkFailure,
    /// HTTP 401
    Unauthorized,
    /// HTTP 4xx other than 401/429
    ClientError,
    /// Token endpoint rejected the client credentials
    InvalidCredentials,
    /// Token endpoint unreachable or returned garbage
    AuthUnavailable,
    /// 2xx response whose body could not be parsed
    MalformedResponse,
    /// Cancelled by the caller or the run budget
    Cancelled,
}

impl ErrorKind {
    /// Check if a failure of this kind may be retried
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerRejected
                | Self::Timeout
                | Self::NetworkFailure
                | Self::Unauthorized
                | Self::AuthUnavailable
        )
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            429 => Self::RateLimited,
            500..=599 => Self::ServerRejected,
            _ => Self::ClientError,
        }
    }

    /// Check if this failure will hit every resource of the run
    pub fn is_run_fatal(self) -> bool {
        matches!(self, Self::InvalidCredentials)
    }

    /// Machine-readable name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerRejected => "server_rejected",
            Self::Timeout => "timeout",
            Self::NetworkFailure => "network_failure",
            Self::Unauthorized => "unauthorized",
            Self::ClientError => "client_error",
            Self::InvalidCredentials => "invalid_credentials",
            Self::AuthUnavailable => "auth_unavailable",
            Self::MalformedResponse => "malformed_response",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AuthErrorKind> for ErrorKind {
    fn from(kind: AuthErrorKind) -> Self {
        match kind {
            AuthErrorKind::InvalidCredentials => Self::InvalidCredentials,
            AuthErrorKind::NetworkFailure | AuthErrorKind::ServerRejected => Self::AuthUnavailable,
        }
    }
}

// ============================================================================
// Structured errors
// ============================================================================

/// OAuth2 token exchange failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("OAuth2 token exchange failed ({kind}): {message}")]
pub struct AuthError {
    /// Failure class
    pub kind: AuthErrorKind,
    /// Human-readable detail (never contains secrets)
    pub message: String,
}

impl AuthError {
    /// Create an auth error
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Check if the exchange may be retried
    pub fn is_retryable(&self) -> bool {
        self.kind != AuthErrorKind::InvalidCredentials
    }
}

/// Permanent failure of a resource page request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "fetch of '{resource}' failed after {attempts} attempt(s): {kind}{}: {message}",
    status_suffix(.http_status)
)]
pub struct FetchError {
    /// Failure class
    pub kind: ErrorKind,
    /// Last HTTP status seen, if any
    pub http_status: Option<u16>,
    /// Resource being extracted
    pub resource: String,
    /// HTTP attempts issued (first try plus retries)
    pub attempts: u32,
    /// Human-readable detail
    pub message: String,
}

impl FetchError {
    /// Create a fetch error
    pub fn new(
        kind: ErrorKind,
        resource: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            http_status: None,
            resource: resource.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Attach the HTTP status
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

// ============================================================================
// Crate error
// ============================================================================

/// The main error type for the extraction engine
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Missing required config field: {field}")]
    MissingConfigField { field: String },

    #[error("Invalid config value for '{field}': {message}")]
    InvalidConfigValue { field: String, message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Unknown resource: {resource}")]
    UnknownResource { resource: String },

    // ============================================================================
    // Extraction Errors
    // ============================================================================
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Extraction cancelled")]
    Cancelled,

    // ============================================================================
    // State Errors
    // ============================================================================
    #[error("State error: {message}")]
    State { message: String },

    // ============================================================================
    // I/O Errors
    // ============================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingConfigField {
            field: field.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfigValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. }
            | Error::MissingConfigField { .. }
            | Error::InvalidConfigValue { .. }
            | Error::YamlParse(_)
            | Error::JsonParse(_)
            | Error::UnknownResource { .. }
            | Error::InvalidUrl(_) => "config_error",
            Error::Auth(_) => "auth_error",
            Error::Fetch(_) | Error::Http(_) => "fetch_error",
            Error::Cancelled => "cancelled",
            Error::State { .. } => "state_error",
            Error::Io(_) => "io_error",
            Error::Other(_) => "other",
        }
    }

    /// Check if this error is a configuration problem (fatal before extraction)
    pub fn is_config(&self) -> bool {
        self.code() == "config_error"
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Auth(e) => e.is_retryable(),
            Error::Fetch(e) => e.kind.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for the extraction engine
pub type Result<T> = std::result::Result<T, Error>;
