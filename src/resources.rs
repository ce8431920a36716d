//! Built-in OIC resource definitions
//!
//! Static mapping from resource names to API endpoints, keys and pagination
//! style. The engine treats this table as configuration: nothing here talks
//! to the network.

use crate::error::{Error, Result};
use crate::pagination::PaginationStyle;
use std::sync::LazyLock;

const INTEGRATION_API: &str = "ic/api/integration/v1";

/// Definition of one extractable resource collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDef {
    /// Resource name (e.g. "integrations")
    pub name: String,
    /// Path relative to the instance base URL
    pub path: String,
    /// Fields that must be present on every record
    pub primary_keys: Vec<String>,
    /// Ordering field used for bookmarks
    pub replication_key: Option<String>,
    /// How pages are addressed
    pub pagination: PaginationStyle,
    /// Query parameters sent on every page request
    pub default_params: Vec<(String, String)>,
}

impl ResourceDef {
    /// Create an offset-paginated resource under the integration API
    pub fn new(name: impl Into<String>, path: impl AsRef<str>) -> Self {
        Self {
            name: name.into(),
            path: format!("{INTEGRATION_API}/{}", path.as_ref().trim_start_matches('/')),
            primary_keys: vec!["id".to_string()],
            replication_key: Some("lastUpdated".to_string()),
            pagination: PaginationStyle::default(),
            default_params: Vec::new(),
        }
    }

    /// Set the primary keys
    #[must_use]
    pub fn primary_keys(mut self, keys: &[&str]) -> Self {
        self.primary_keys = keys.iter().map(ToString::to_string).collect();
        self
    }

    /// Set the replication key
    #[must_use]
    pub fn replication_key(mut self, key: impl Into<String>) -> Self {
        self.replication_key = Some(key.into());
        self
    }

    /// Set the pagination style
    #[must_use]
    pub fn pagination(mut self, style: PaginationStyle) -> Self {
        self.pagination = style;
        self
    }

    /// Add a default query parameter
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_params.push((key.into(), value.into()));
        self
    }
}

/// All built-in resources, in extraction order
///
/// Walks are ordered ascending on the replication key by the paginator, so
/// no entry carries its own `orderBy`.
pub static BUILTIN_RESOURCES: LazyLock<Vec<ResourceDef>> = LazyLock::new(|| {
    vec![
        // Design-time
        ResourceDef::new("integrations", "integrations").param("expand", "connections,endpoints"),
        ResourceDef::new("connections", "connections"),
        ResourceDef::new("packages", "packages"),
        ResourceDef::new("lookups", "lookups").primary_keys(&["name"]),
        ResourceDef::new("libraries", "libraries"),
        ResourceDef::new("certificates", "certificates").primary_keys(&["alias"]),
        ResourceDef::new("adapters", "adapters"),
        ResourceDef::new("agent_groups", "agentGroups"),
        // Monitoring
        ResourceDef::new("executions", "monitoring/executions")
            .primary_keys(&["executionId"])
            .replication_key("startTime")
            .param("expand", "errorDetails,businessData"),
        ResourceDef::new("metrics", "monitoring/metrics")
            .primary_keys(&["metricId", "timestamp"])
            .replication_key("timestamp"),
        ResourceDef::new("monitoring_errors", "monitoring/errors")
            .primary_keys(&["errorId"])
            .replication_key("timestamp"),
        ResourceDef::new("audit_events", "monitoring/audit")
            .primary_keys(&["auditId"])
            .replication_key("timestamp"),
        ResourceDef::new("monitoring_instances", "monitoring/instances")
            .primary_keys(&["instanceId"]),
    ]
});

/// Look up a built-in resource by name
pub fn find_resource(name: &str) -> Result<ResourceDef> {
    BUILTIN_RESOURCES
        .iter()
        .find(|r| r.name == name)
        .cloned()
        .ok_or_else(|| Error::UnknownResource {
            resource: name.to_string(),
        })
}

/// Resolve a selection of resource names, preserving the given order.
/// `None` selects every built-in resource.
pub fn select_resources(names: Option<&[String]>) -> Result<Vec<ResourceDef>> {
    match names {
        None => Ok(BUILTIN_RESOURCES.clone()),
        Some(names) => names.iter().map(|n| find_resource(n)).collect(),
    }
}

/// List built-in resource names
pub fn list_resources() -> Vec<&'static str> {
    BUILTIN_RESOURCES.iter().map(|r| r.name.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_resource() {
        let res = find_resource("integrations").unwrap();
        assert_eq!(res.path, "ic/api/integration/v1/integrations");
        assert_eq!(res.primary_keys, vec!["id".to_string()]);
        assert_eq!(res.replication_key.as_deref(), Some("lastUpdated"));
        assert_eq!(
            res.default_params,
            vec![("expand".to_string(), "connections,endpoints".to_string())]
        );
    }

    #[test]
    fn test_monitoring_resources() {
        let executions = find_resource("executions").unwrap();
        assert_eq!(executions.path, "ic/api/integration/v1/monitoring/executions");
        assert_eq!(executions.primary_keys, vec!["executionId".to_string()]);
        assert_eq!(executions.replication_key.as_deref(), Some("startTime"));

        let metrics = find_resource("metrics").unwrap();
        assert_eq!(metrics.primary_keys, vec!["metricId".to_string(), "timestamp".to_string()]);

        let audit = find_resource("audit_events").unwrap();
        assert_eq!(audit.path, "ic/api/integration/v1/monitoring/audit");
        assert_eq!(audit.replication_key.as_deref(), Some("timestamp"));
    }

    #[test]
    fn test_builtins_use_offset_paging_without_ordering() {
        for resource in BUILTIN_RESOURCES.iter() {
            assert_eq!(resource.pagination, PaginationStyle::default(), "{}", resource.name);
            assert!(
                resource.default_params.iter().all(|(k, _)| k != "orderBy"),
                "{}",
                resource.name
            );
        }
    }

    #[test]
    fn test_find_unknown_resource() {
        let err = find_resource("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownResource { resource } if resource == "nope"));
    }

    #[test]
    fn test_select_resources_preserves_order() {
        let names = vec!["lookups".to_string(), "connections".to_string()];
        let selected = select_resources(Some(&names)).unwrap();
        let got: Vec<_> = selected.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(got, vec!["lookups", "connections"]);

        assert_eq!(select_resources(None).unwrap().len(), BUILTIN_RESOURCES.len());
    }

    #[test]
    fn test_resource_names_unique() {
        let mut names = list_resources();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_path_normalization() {
        let res = ResourceDef::new("x", "/agentGroups");
        assert_eq!(res.path, "ic/api/integration/v1/agentGroups");
    }
}
