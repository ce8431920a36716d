//! Engine types
//!
//! Messages emitted during a run and the report returned at its end.

use crate::error::ErrorKind;
use crate::http::ExecutorStats;
use crate::state::{Bookmark, BookmarkState};
use crate::types::JsonObject;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A message emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// One extracted record
    Record {
        /// Resource name
        resource: String,
        /// Record fields as returned by the API
        record: JsonObject,
    },
    /// Bookmarks after the run
    State(BookmarkState),
    /// A resource finished cleanly
    ResourceCompleted(ResourceSummary),
    /// A resource stopped early
    ResourceFailed(ResourceFailure),
}

impl Message {
    /// Create a record message
    pub fn record(resource: impl Into<String>, record: JsonObject) -> Self {
        Self::Record {
            resource: resource.into(),
            record,
        }
    }

    /// Check if this is a record message
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record { .. })
    }

    /// Check if this is a state message
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }

    /// Resource this message belongs to, if any
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Record { resource, .. } => Some(resource),
            Self::ResourceCompleted(summary) => Some(&summary.resource),
            Self::ResourceFailed(failure) => Some(&failure.resource),
            Self::State(_) => None,
        }
    }
}

/// Outcome of a resource that ran to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    /// Resource name
    pub resource: String,
    /// Records emitted
    pub records: u64,
    /// Bookmark after the resource finished
    pub bookmark: Option<Bookmark>,
    /// Wall-clock time spent
    pub duration_ms: u64,
}

/// Outcome of a resource that stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    /// Resource name
    pub resource: String,
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable cause
    pub reason: String,
    /// Bookmark reached before the failure
    pub last_bookmark: Option<Bookmark>,
    /// Records emitted before the failure
    pub records_emitted: u64,
}

/// Statistics from a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Records emitted across all resources
    pub records_emitted: u64,
    /// Resources that completed
    pub resources_completed: usize,
    /// Resources that failed
    pub resources_failed: usize,
    /// HTTP requests sent
    pub requests: u64,
    /// Retries scheduled
    pub retries: u64,
    /// Re-authentications after a 401
    pub reauths: u64,
    /// Requests that timed out
    pub timeouts: u64,
    /// OAuth2 token exchanges
    pub token_exchanges: u64,
    /// Run duration in milliseconds
    pub duration_ms: u64,
}

impl RunStats {
    /// Create new stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Add records
    pub fn add_records(&mut self, count: u64) {
        self.records_emitted += count;
    }

    /// Add a completed resource
    pub fn add_completed(&mut self) {
        self.resources_completed += 1;
    }

    /// Add a failed resource
    pub fn add_failed(&mut self) {
        self.resources_failed += 1;
    }

    /// Fold in executor counters
    pub fn add_executor(&mut self, stats: ExecutorStats) {
        self.requests += stats.requests;
        self.retries += stats.retries;
        self.reauths += stats.reauths;
        self.timeouts += stats.timeouts;
    }

    /// Set duration
    pub fn set_duration(&mut self, ms: u64) {
        self.duration_ms = ms;
    }
}

/// Result of a full run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Resources that completed, in catalog order
    pub completed: Vec<ResourceSummary>,
    /// Resources that failed, in catalog order
    pub failed: Vec<ResourceFailure>,
    /// Bookmarks at the end of the run
    pub bookmarks: BookmarkState,
    /// Run statistics
    pub stats: RunStats,
    /// Whether the run was cut short by cancellation or its time budget
    pub cancelled: bool,
}

impl RunReport {
    /// Check if every resource completed
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    /// Failure of a resource, if it failed
    pub fn failure(&self, resource: &str) -> Option<&ResourceFailure> {
        self.failed.iter().find(|f| f.resource == resource)
    }

    /// Summary of a resource, if it completed
    pub fn summary(&self, resource: &str) -> Option<&ResourceSummary> {
        self.completed.iter().find(|s| s.resource == resource)
    }
}

/// Outcome of a connection check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// When the token used for the check expires
    pub token_expires_at: DateTime<Utc>,
    /// Resource read by the check
    pub checked_resource: String,
    /// Total size reported for that resource, if any
    pub total_results: Option<u64>,
}
