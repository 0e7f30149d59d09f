pub mod resolver;
pub mod source;

pub use resolver::{EffectivePolicy, ResolutionSource, resolve};
pub use source::{PolicySource, FilePolicySource};

use serde::{Deserialize, Serialize};

use crate::ratelimit::Quota;

fn default_true() -> bool {
    true
}

fn default_schema_version() -> u32 {
    1
}

/// How caller credentials are forwarded to the backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum AuthPropagationMode {
    #[default]
    None,
    /// Pick a mechanism based on which credential fields are present.
    Infer,
    Bearer,
    ApiKey,
    Cookies,
    AdditionalHeaders,
}

/// One allow/deny rule. A rule is a selector — any of operation id, route
/// template, or display name, optionally narrowed by HTTP method — plus
/// optional per-tool settings that apply when the rule wins resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(default, rename = "operationId")]
    pub operation_id: Option<String>,
    #[serde(default, rename = "routeTemplate")]
    pub route_template: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    /// HTTP method; absent matches any method.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(default, rename = "concurrencyLimit")]
    pub concurrency_limit: Option<u32>,
    #[serde(default, rename = "authPropagationMode")]
    pub auth_propagation_mode: Option<AuthPropagationMode>,
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: Option<Quota>,
}

impl Default for PolicyEntry {
    fn default() -> Self {
        Self {
            operation_id: None,
            route_template: None,
            display_name: None,
            method: None,
            enabled: true,
            timeout_ms: None,
            concurrency_limit: None,
            auth_propagation_mode: None,
            rate_limit: None,
        }
    }
}

impl PolicyEntry {
    /// Whether the entry names at least one of the three selectors.
    pub fn has_selector(&self) -> bool {
        self.operation_id.is_some() || self.route_template.is_some() || self.display_name.is_some()
    }

    /// Method narrowing: an absent method matches any; otherwise the
    /// comparison is case-insensitive. An entry that demands a method never
    /// matches a descriptor without one.
    pub fn method_matches(&self, descriptor_method: Option<&str>) -> bool {
        match (&self.method, descriptor_method) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
        }
    }
}

/// Validation outcome: warnings are logged and the document is used;
/// errors keep the previous valid document in place.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The access-control document. Immutable snapshot; a new version is a new
/// document with a new `source_version` token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default = "default_schema_version", rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default, rename = "denyByDefault")]
    pub deny_by_default: bool,
    #[serde(default)]
    pub allow: Vec<PolicyEntry>,
    #[serde(default)]
    pub deny: Vec<PolicyEntry>,
    /// Opaque monotone token supplied by the source (file mtime, KV index).
    #[serde(default, rename = "sourceVersion")]
    pub source_version: String,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            deny_by_default: false,
            allow: Vec::new(),
            deny: Vec::new(),
            source_version: String::new(),
        }
    }
}

impl PolicyDocument {
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        if self.schema_version < 1 {
            report
                .errors
                .push("schemaVersion must be >= 1".to_string());
        }
        for (list, entries) in [("allow", &self.allow), ("deny", &self.deny)] {
            for (i, entry) in entries.iter().enumerate() {
                if !entry.has_selector() {
                    report.warnings.push(format!(
                        "{}[{}]: entry has no operationId, routeTemplate, or displayName and can never match",
                        list, i
                    ));
                }
                if entry.concurrency_limit == Some(0) {
                    report
                        .errors
                        .push(format!("{}[{}]: concurrencyLimit must be > 0", list, i));
                }
                if entry.timeout_ms == Some(0) {
                    report
                        .warnings
                        .push(format!("{}[{}]: timeoutMs of 0 disables the call", list, i));
                }
                if let Some(quota) = &entry.rate_limit
                    && let Err(e) = quota.validate()
                {
                    report.errors.push(format!("{}[{}]: {}", list, i, e));
                }
            }
        }
        report
    }
}
