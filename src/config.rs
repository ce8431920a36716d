//! Extractor configuration
//!
//! Config files (JSON or YAML) deserialize into [`RawConfig`], where every
//! field is optional, and are validated once into the typed
//! [`ExtractorConfig`] the rest of the crate consumes.

use crate::auth::ClientCredentials;
use crate::error::{Error, Result};
use crate::http::{BackoffPolicy, RateLimiterConfig};
use crate::pagination::{PaginatorConfig, DEFAULT_MIN_PAGE_SIZE, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::resources::find_resource;
use crate::state::HighWaterMark;
use crate::types::{JsonValue, SyncMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_REFRESH_MARGIN_SECS: u64 = 60;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;
const DEFAULT_MAX_CONCURRENT_RESOURCES: usize = 4;

// ============================================================================
// Raw config
// ============================================================================

/// Config as written by the user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// OIC instance URL
    pub base_url: Option<String>,
    /// OAuth2 client ID
    pub oauth_client_id: Option<String>,
    /// OAuth2 client secret
    pub oauth_client_secret: Option<String>,
    /// Identity domain token endpoint
    pub oauth_token_url: Option<String>,
    /// Audience, sent as scope unless `oauth_scope` is set
    #[serde(alias = "oauth_client_aud")]
    pub oauth_audience: Option<String>,
    /// Explicit scope
    pub oauth_scope: Option<String>,

    /// Records per page
    pub page_size: Option<u32>,
    /// Floor for adaptive page shrinking
    pub min_page_size: Option<u32>,
    /// Per-request timeout
    pub request_timeout_seconds: Option<u64>,
    /// Retries per request
    pub max_retries: Option<u32>,
    /// Refresh tokens this long before expiry
    pub token_refresh_margin_seconds: Option<u64>,
    /// First backoff delay
    pub initial_backoff_ms: Option<u64>,
    /// Backoff ceiling
    pub max_backoff_ms: Option<u64>,
    /// Client-side request cap
    pub max_requests_per_second: Option<u32>,

    /// Resources extracted in parallel
    pub max_concurrent_resources: Option<usize>,
    /// Stop every resource after the first failure
    pub fail_fast: Option<bool>,
    /// Wall-clock budget for the whole run
    pub max_run_seconds: Option<u64>,
    /// Checkpoint after every page
    pub checkpoint_per_page: Option<bool>,

    /// Resources to extract (all when absent)
    pub resources: Option<Vec<String>>,
    /// Incremental or full refresh
    pub sync_mode: Option<SyncMode>,
    /// Fallback start value for resources without a bookmark
    pub start_date: Option<String>,
    /// Start value per resource
    pub start_bookmarks: HashMap<String, JsonValue>,

    /// Extra `q` filter
    pub custom_filter: Option<String>,
    /// `orderBy` field override
    pub sort_field: Option<String>,
    /// Sort descending
    pub sort_desc: Option<bool>,
    /// `expand` override
    pub expand: Option<Vec<String>>,
    /// Restrict results to one integration instance
    pub instance_id: Option<String>,
    /// Fields to return instead of full records
    pub select_fields: Option<Vec<String>>,
}

// ============================================================================
// Validated config
// ============================================================================

/// Validated extractor configuration
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// OIC instance URL
    pub base_url: Url,
    /// OAuth2 client credentials
    pub credentials: ClientCredentials,
    /// Records per page
    pub page_size: u32,
    /// Floor for adaptive page shrinking
    pub min_page_size: u32,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Retries per request
    pub max_retries: u32,
    /// Proactive token refresh margin
    pub token_refresh_margin: Duration,
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Client-side request cap
    pub max_requests_per_second: Option<u32>,
    /// Resources extracted in parallel
    pub max_concurrent_resources: usize,
    /// Stop every resource after the first failure
    pub fail_fast: bool,
    /// Wall-clock budget for the whole run
    pub max_run: Option<Duration>,
    /// Checkpoint after every page
    pub checkpoint_per_page: bool,
    /// Resources to extract (all when `None`)
    pub resources: Option<Vec<String>>,
    /// Incremental or full refresh
    pub sync_mode: SyncMode,
    /// Start values for resources without a persisted bookmark
    pub start_bookmarks: HashMap<String, HighWaterMark>,
    /// Extra `q` filter
    pub custom_filter: Option<String>,
    /// `orderBy` override
    pub order_by: Option<String>,
    /// `expand` override
    pub expand: Option<String>,
    /// `integrationInstance` filter
    pub instance_id: Option<String>,
    /// `fields` projection, comma-joined
    pub select_fields: Option<String>,
}

impl ExtractorConfig {
    /// Load and validate a config file; `.yaml`/`.yml` are read as YAML,
    /// anything else as JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file '{}': {e}", path.display()))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    /// Parse and validate JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;
        Self::from_raw(raw)
    }

    /// Validate a raw config
    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        let base_url = parse_url("base_url", &required(raw.base_url, "base_url")?)?;
        let client_id = required(raw.oauth_client_id, "oauth_client_id")?;
        let client_secret = required(raw.oauth_client_secret, "oauth_client_secret")?;
        let token_url = required(raw.oauth_token_url, "oauth_token_url")?;
        parse_url("oauth_token_url", &token_url)?;

        let mut credentials = ClientCredentials::new(client_id, client_secret, token_url);
        if let Some(audience) = non_empty(raw.oauth_audience) {
            credentials = credentials.with_audience(audience);
        }
        if let Some(scope) = non_empty(raw.oauth_scope) {
            credentials = credentials.with_scope(scope);
        }

        let page_size = raw.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::invalid_value(
                "page_size",
                format!("must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"),
            ));
        }

        let min_page_size = raw
            .min_page_size
            .unwrap_or(DEFAULT_MIN_PAGE_SIZE)
            .min(page_size);
        if min_page_size == 0 {
            return Err(Error::invalid_value("min_page_size", "must be at least 1"));
        }

        let timeout_secs = raw
            .request_timeout_seconds
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(Error::invalid_value("request_timeout_seconds", "must be at least 1"));
        }

        let initial_backoff =
            Duration::from_millis(raw.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS));
        let max_backoff =
            Duration::from_millis(raw.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS));
        if max_backoff < initial_backoff {
            return Err(Error::invalid_value(
                "max_backoff_ms",
                "must not be smaller than initial_backoff_ms",
            ));
        }

        let max_concurrent_resources = raw
            .max_concurrent_resources
            .unwrap_or(DEFAULT_MAX_CONCURRENT_RESOURCES);
        if max_concurrent_resources == 0 {
            return Err(Error::invalid_value("max_concurrent_resources", "must be at least 1"));
        }

        if raw.max_requests_per_second == Some(0) {
            return Err(Error::invalid_value("max_requests_per_second", "must be at least 1"));
        }

        let resources = match raw.resources {
            Some(names) if names.is_empty() => {
                return Err(Error::invalid_value("resources", "must not be empty"))
            }
            Some(names) => {
                for name in &names {
                    find_resource(name)?;
                }
                Some(names)
            }
            None => None,
        };

        let start_bookmarks = start_bookmarks(raw.start_bookmarks, raw.start_date.as_deref())?;

        let order_by = non_empty(raw.sort_field).map(|field| {
            let direction = if raw.sort_desc.unwrap_or(false) { "desc" } else { "asc" };
            format!("{field}:{direction}")
        });

        Ok(Self {
            base_url,
            credentials,
            page_size,
            min_page_size,
            request_timeout: Duration::from_secs(timeout_secs),
            max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            token_refresh_margin: Duration::from_secs(
                raw.token_refresh_margin_seconds
                    .unwrap_or(DEFAULT_REFRESH_MARGIN_SECS),
            ),
            initial_backoff,
            max_backoff,
            max_requests_per_second: raw.max_requests_per_second,
            max_concurrent_resources,
            fail_fast: raw.fail_fast.unwrap_or(false),
            max_run: raw.max_run_seconds.map(Duration::from_secs),
            checkpoint_per_page: raw.checkpoint_per_page.unwrap_or(true),
            resources,
            sync_mode: raw.sync_mode.unwrap_or_default(),
            start_bookmarks,
            custom_filter: non_empty(raw.custom_filter),
            order_by,
            expand: raw
                .expand
                .filter(|e| !e.is_empty())
                .map(|e| e.join(",")),
            instance_id: non_empty(raw.instance_id),
            select_fields: raw
                .select_fields
                .filter(|f| !f.is_empty())
                .map(|f| f.join(",")),
        })
    }

    /// Paginator settings
    pub fn paginator_config(&self) -> PaginatorConfig {
        PaginatorConfig {
            page_size: self.page_size,
            min_page_size: self.min_page_size,
            checkpoint_per_page: self.checkpoint_per_page,
            sync_mode: self.sync_mode,
            custom_filter: self.custom_filter.clone(),
            order_by: self.order_by.clone(),
            expand: self.expand.clone(),
            instance_id: self.instance_id.clone(),
            select_fields: self.select_fields.clone(),
        }
    }

    /// Backoff policy
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.initial_backoff, self.max_backoff, self.max_retries)
    }

    /// Client-side throttle, if configured
    pub fn rate_limiter_config(&self) -> Option<RateLimiterConfig> {
        self.max_requests_per_second
            .map(RateLimiterConfig::per_second)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    non_empty(value).ok_or_else(|| Error::missing_field(field))
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value).map_err(|e| Error::invalid_value(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::invalid_value(
            field,
            format!("unsupported scheme '{other}'"),
        )),
    }
}

fn start_bookmarks(
    raw: HashMap<String, JsonValue>,
    start_date: Option<&str>,
) -> Result<HashMap<String, HighWaterMark>> {
    let mut marks = HashMap::new();

    for (resource, value) in raw {
        find_resource(&resource)?;
        let mark = HighWaterMark::from_json(&value).ok_or_else(|| {
            Error::invalid_value(
                format!("start_bookmarks.{resource}"),
                "expected a timestamp, integer or string",
            )
        })?;
        marks.insert(resource, mark);
    }

    if let Some(date) = start_date.map(str::trim).filter(|d| !d.is_empty()) {
        let mark = match HighWaterMark::parse(date) {
            HighWaterMark::Text(_) => {
                return Err(Error::invalid_value("start_date", "expected an ISO-8601 timestamp"))
            }
            mark => mark,
        };
        for resource in crate::resources::BUILTIN_RESOURCES.iter() {
            if resource.replication_key.is_some() {
                marks
                    .entry(resource.name.clone())
                    .or_insert_with(|| mark.clone());
            }
        }
    }

    Ok(marks)
}
