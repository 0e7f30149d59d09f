pub mod builder;
pub mod provider;

pub use builder::build_snapshot;
pub use provider::CatalogProvider;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::EffectivePolicy;

/// Description of one backend HTTP endpoint, supplied by the external
/// endpoint-discovery collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    #[serde(default, rename = "routeTemplate")]
    pub route_template: Option<String>,
    #[serde(default, rename = "httpMethod")]
    pub http_method: Option<String>,
    #[serde(default, rename = "operationId")]
    pub operation_id: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default, rename = "requiresAuth")]
    pub requires_auth: bool,
    #[serde(default, rename = "acceptableAuthSchemes")]
    pub acceptable_auth_schemes: Vec<String>,
    /// Human-readable summary forwarded into the tool listing.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema of the tool arguments, when discovery provided one.
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

impl EndpointDescriptor {
    /// At least one of the three identifying fields must be set for the
    /// descriptor to be resolvable against a policy.
    pub fn is_identifiable(&self) -> bool {
        self.operation_id.is_some() || self.route_template.is_some() || self.display_name.is_some()
    }
}

/// One tool as exposed over MCP. Lives inside a snapshot and is therefore
/// immutable.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub endpoint: EndpointDescriptor,
    pub effective_policy: EffectivePolicy,
}

/// Immutable view of the current tool set. Readers always observe a whole
/// snapshot; the provider swaps the current one atomically.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub created_utc: DateTime<Utc>,
    pub policy_source_version: String,
    /// Insertion order is preserved so `tools/list` output is deterministic.
    pub tools: IndexMap<String, ToolDescriptor>,
}

impl CatalogSnapshot {
    pub fn empty() -> Self {
        Self {
            created_utc: Utc::now(),
            policy_source_version: String::new(),
            tools: IndexMap::new(),
        }
    }

    pub fn get(&self, tool_name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool_name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Age of this snapshot in seconds, for diagnostics.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.created_utc).num_seconds()
    }
}
