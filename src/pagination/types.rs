//! Pagination types
//!
//! Page addressing, the request/response pair exchanged with the executor,
//! and the adaptive page size controller.

use crate::http::RateLimitHint;
use crate::types::{JsonValue, Record};
use serde::Serialize;

/// Default records per page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Largest page size the API accepts
pub const MAX_PAGE_SIZE: u32 = 500;

/// Default floor for adaptive shrinking
pub const DEFAULT_MIN_PAGE_SIZE: u32 = 10;

/// Consecutive timeout-affected pages before the page size halves
const SHRINK_AFTER: u32 = 2;

/// Consecutive clean pages before the page size doubles back
const GROW_AFTER: u32 = 5;

// ============================================================================
// Cursor & style
// ============================================================================

/// Position of a page within a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageCursor {
    /// Numeric offset
    Offset(u64),
    /// Opaque continuation token
    Token(String),
}

/// How a resource addresses its pages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationStyle {
    /// `?limit=<n>&offset=<k>`
    Offset {
        /// Offset query parameter
        offset_param: String,
        /// Page size query parameter
        limit_param: String,
    },
    /// `?limit=<n>&<cursor_param>=<token>`, token read from the response body
    CursorToken {
        /// Token query parameter
        cursor_param: String,
        /// Dotted path of the next token in the response body
        cursor_path: String,
        /// Page size query parameter
        limit_param: String,
    },
}

impl Default for PaginationStyle {
    fn default() -> Self {
        Self::Offset {
            offset_param: "offset".to_string(),
            limit_param: "limit".to_string(),
        }
    }
}

impl PaginationStyle {
    /// Create a cursor-token style
    pub fn cursor_token(cursor_param: impl Into<String>, cursor_path: impl Into<String>) -> Self {
        Self::CursorToken {
            cursor_param: cursor_param.into(),
            cursor_path: cursor_path.into(),
            limit_param: "limit".to_string(),
        }
    }

    /// Cursor of the first page
    pub fn initial_cursor(&self) -> Option<PageCursor> {
        match self {
            Self::Offset { .. } => Some(PageCursor::Offset(0)),
            Self::CursorToken { .. } => None,
        }
    }

    fn limit_param(&self) -> &str {
        match self {
            Self::Offset { limit_param, .. } | Self::CursorToken { limit_param, .. } => limit_param,
        }
    }
}

// ============================================================================
// Request / result
// ============================================================================

/// One page request, built by the paginator and consumed by the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Resource name
    pub resource: String,
    /// Path relative to the base URL
    pub path: String,
    /// Page position; `None` is the first page of a token-paginated resource
    pub cursor: Option<PageCursor>,
    /// Records per page
    pub page_size: u32,
    /// Extra query parameters (ordering, filters)
    pub query: Vec<(String, String)>,
    /// Addressing style
    pub style: PaginationStyle,
}

impl PageRequest {
    /// Query parameters to send, cursor and page size included
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.query.clone();
        pairs.push((self.style.limit_param().to_string(), self.page_size.to_string()));

        match (&self.style, &self.cursor) {
            (PaginationStyle::Offset { offset_param, .. }, cursor) => {
                let offset = match cursor {
                    Some(PageCursor::Offset(n)) => *n,
                    _ => 0,
                };
                pairs.push((offset_param.clone(), offset.to_string()));
            }
            (PaginationStyle::CursorToken { cursor_param, .. }, Some(PageCursor::Token(token))) => {
                pairs.push((cursor_param.clone(), token.clone()));
            }
            (PaginationStyle::CursorToken { .. }, _) => {}
        }

        pairs
    }

    fn offset(&self) -> u64 {
        match self.cursor {
            Some(PageCursor::Offset(n)) => n,
            _ => 0,
        }
    }
}

/// One parsed page
#[derive(Debug, Clone, Default)]
pub struct PageResult {
    /// Records in server order
    pub records: Vec<Record>,
    /// Cursor of the following page, if any
    pub next_cursor: Option<PageCursor>,
    /// Whether the server has more records
    pub has_more: bool,
    /// Total size of the collection, when reported
    pub total_results: Option<u64>,
    /// Server throttling hint from this response
    pub rate_limit: RateLimitHint,
    /// Attempts of this page that timed out before it succeeded
    pub timeouts: u32,
    /// Items dropped because they were not JSON objects
    pub skipped: usize,
}

impl PageResult {
    /// Parse a response body
    ///
    /// Accepts the OIC envelope `{items, totalResults, hasMore, limit,
    /// offset}`, a `{data: [...]}` envelope, or a bare array. When `hasMore`
    /// is missing it is inferred: a full page means more may follow.
    pub fn from_body(request: &PageRequest, body: JsonValue) -> Result<Self, String> {
        let (items, envelope) = match body {
            JsonValue::Array(items) => (items, None),
            JsonValue::Object(mut map) => {
                let items = match map.remove("items").or_else(|| map.remove("data")) {
                    Some(JsonValue::Array(items)) => items,
                    Some(other) => {
                        return Err(format!("expected an items array, got {}", type_name(&other)))
                    }
                    None if map.contains_key("hasMore") || map.contains_key("totalResults") => {
                        Vec::new()
                    }
                    None => return Err("response has no items array".to_string()),
                };
                (items, Some(map))
            }
            other => return Err(format!("expected an object or array, got {}", type_name(&other))),
        };

        let field = |name: &str| envelope.as_ref().and_then(|m| m.get(name));
        let total_results = field("totalResults").and_then(JsonValue::as_u64);
        let server_has_more = field("hasMore").and_then(JsonValue::as_bool);
        let limit = field("limit")
            .and_then(JsonValue::as_u64)
            .unwrap_or(u64::from(request.page_size));

        let item_count = items.len() as u64;
        let mut skipped = 0;
        let records = items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(fields) => Some(Record::new(request.resource.clone(), fields)),
                _ => {
                    skipped += 1;
                    None
                }
            })
            .collect();

        let (next_cursor, has_more) = match &request.style {
            PaginationStyle::Offset { .. } => {
                let has_more =
                    item_count > 0 && server_has_more.unwrap_or(item_count >= limit.max(1));
                let next = has_more.then(|| PageCursor::Offset(request.offset() + item_count));
                (next, has_more)
            }
            PaginationStyle::CursorToken { cursor_path, .. } => {
                let token = envelope
                    .as_ref()
                    .and_then(|m| lookup_path(m, cursor_path))
                    .and_then(JsonValue::as_str)
                    .filter(|t| !t.is_empty())
                    .map(|t| PageCursor::Token(t.to_string()));
                let has_more = token.is_some() && server_has_more.unwrap_or(true);
                (if has_more { token } else { None }, has_more)
            }
        };

        Ok(Self {
            records,
            next_cursor,
            has_more,
            total_results,
            rate_limit: RateLimitHint::default(),
            timeouts: 0,
            skipped,
        })
    }
}

fn lookup_path<'a>(
    map: &'a serde_json::Map<String, JsonValue>,
    path: &str,
) -> Option<&'a JsonValue> {
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// ============================================================================
// Adaptive page size
// ============================================================================

/// Shrinks the page size under timeouts and grows it back once pages are
/// clean again
#[derive(Debug, Clone)]
pub struct PageSizeController {
    current: u32,
    default: u32,
    min: u32,
    timeout_streak: u32,
    clean_streak: u32,
}

impl PageSizeController {
    /// Create a controller starting at `default`, never below `min`
    pub fn new(default: u32, min: u32) -> Self {
        let default = default.clamp(1, MAX_PAGE_SIZE);
        Self {
            current: default,
            default,
            min: min.clamp(1, default),
            timeout_streak: 0,
            clean_streak: 0,
        }
    }

    /// Current page size
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Record a successful page that needed `timeouts` timed-out attempts.
    /// Returns the new size if it changed.
    pub fn record_page(&mut self, timeouts: u32) -> Option<u32> {
        if timeouts > 0 {
            self.clean_streak = 0;
            self.timeout_streak += 1;
            if self.timeout_streak >= SHRINK_AFTER {
                self.timeout_streak = 0;
                return self.shrink().then_some(self.current);
            }
            return None;
        }

        self.timeout_streak = 0;
        self.clean_streak += 1;
        if self.clean_streak >= GROW_AFTER && self.current < self.default {
            self.clean_streak = 0;
            self.current = self.current.saturating_mul(2).min(self.default);
            return Some(self.current);
        }
        None
    }

    /// Halve the page size. Returns false when already at the floor.
    pub fn shrink(&mut self) -> bool {
        if self.current <= self.min {
            return false;
        }
        self.current = (self.current / 2).max(self.min);
        self.clean_streak = 0;
        true
    }
}
