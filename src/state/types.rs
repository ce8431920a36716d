//! State types
//!
//! Bookmarks and the high-water marks they carry.

use crate::types::JsonValue;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp layout OIC uses in some payloads ("2024-01-15T10:30:00.000+0000")
const OIC_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Largest replication key value seen for a resource
///
/// Values of different shapes are incomparable: `partial_cmp` returns `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HighWaterMark {
    /// ISO-8601 timestamp
    Timestamp(DateTime<Utc>),
    /// Integer sequence
    Integer(i64),
    /// Any other string, compared lexicographically
    Text(String),
}

impl HighWaterMark {
    /// Interpret a record field as a high-water mark
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Some(Self::parse(s)),
            JsonValue::Number(n) => n.as_i64().map(Self::Integer),
            _ => None,
        }
    }

    /// Parse a string, preferring a timestamp reading
    pub fn parse(s: &str) -> Self {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Self::Timestamp(ts.with_timezone(&Utc));
        }
        if let Ok(ts) = DateTime::parse_from_str(s, OIC_TIMESTAMP_FORMAT) {
            return Self::Timestamp(ts.with_timezone(&Utc));
        }
        Self::Text(s.to_string())
    }

    /// Value as used in query filters
    pub fn to_filter_value(&self) -> String {
        match self {
            Self::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Self::Integer(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            Self::Timestamp(_) => "timestamp",
            Self::Integer(_) => "integer",
            Self::Text(_) => "text",
        }
    }

    /// Check whether two marks can be ordered
    pub fn same_shape(&self, other: &Self) -> bool {
        self.shape() == other.shape()
    }
}

impl PartialOrd for HighWaterMark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Timestamp(a), Self::Timestamp(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.partial_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for HighWaterMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_filter_value())
    }
}

/// Per-resource bookmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Resource name
    pub resource: String,
    /// Largest replication key value extracted so far
    pub high_water_mark: HighWaterMark,
    /// When the bookmark last advanced
    pub last_run_at: DateTime<Utc>,
}

impl Bookmark {
    /// Create a bookmark stamped with the current time
    pub fn new(resource: impl Into<String>, high_water_mark: HighWaterMark) -> Self {
        Self {
            resource: resource.into(),
            high_water_mark,
            last_run_at: Utc::now(),
        }
    }
}

/// Persisted bookmark document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkState {
    /// Bookmarks keyed by resource
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Bookmark>,
}

impl BookmarkState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the bookmark of a resource
    pub fn get(&self, resource: &str) -> Option<&Bookmark> {
        self.bookmarks.get(resource)
    }

    /// Insert or replace a bookmark
    pub fn insert(&mut self, bookmark: Bookmark) {
        self.bookmarks.insert(bookmark.resource.clone(), bookmark);
    }

    /// Check if no resource has a bookmark
    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }
}
