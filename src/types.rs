//! Common types used throughout the extraction engine
//!
//! This module contains shared type definitions, type aliases,
//! and utility types used across multiple modules.

use serde::{Deserialize, Serialize};

// ============================================================================
// Type Aliases
// ============================================================================

/// JSON value type (re-exported from serde_json)
pub type JsonValue = serde_json::Value;

/// JSON object type
pub type JsonObject = serde_json::Map<String, JsonValue>;

// ============================================================================
// Record
// ============================================================================

/// A single extracted record
///
/// Immutable once built by the executor; field order is preserved as the
/// server sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Resource the record belongs to (e.g. "integrations")
    pub resource_type: String,
    /// Record fields
    pub fields: JsonObject,
}

impl Record {
    /// Create a new record
    pub fn new(resource_type: impl Into<String>, fields: JsonObject) -> Self {
        Self {
            resource_type: resource_type.into(),
            fields,
        }
    }

    /// Get a top-level field
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    /// Get a field by dotted path (e.g. "status.lastUpdated")
    pub fn get_path(&self, path: &str) -> Option<&JsonValue> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Consume the record, returning its fields
    pub fn into_fields(self) -> JsonObject {
        self.fields
    }
}

// ============================================================================
// Sync Mode
// ============================================================================

/// Synchronization mode for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fetch everything, no bookmark filter
    FullRefresh,
    /// Only fetch records at or after the bookmark
    #[default]
    Incremental,
}
