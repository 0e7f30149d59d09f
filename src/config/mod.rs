pub mod watcher;

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::EndpointDescriptor;
use crate::errors::{ContextifyError, ContextifyResult};
use crate::gateway::upstream::Upstream;
use crate::policy::PolicyDocument;
use crate::ratelimit::Quota;
use crate::rpc::TransportLimits;

fn default_true() -> bool {
    true
}

/// Which request surfaces the host exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// HTTP when a listen port is configured, stdio when attached to a pipe.
    #[default]
    Auto,
    Http,
    Stdio,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default, rename = "transportMode")]
    pub transport_mode: TransportMode,
    #[serde(default, rename = "applicationName")]
    pub application_name: Option<String>,
    #[serde(default, rename = "applicationVersion")]
    pub application_version: Option<String>,
    #[serde(default, rename = "enableDebugEndpoints")]
    pub enable_debug_endpoints: bool,
    #[serde(default = "default_listen_host", rename = "listenHost")]
    pub listen_host: String,
    #[serde(default = "default_listen_port", rename = "listenPort")]
    pub listen_port: u16,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8320
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            transport_mode: TransportMode::default(),
            application_name: None,
            application_version: None,
            enable_debug_endpoints: false,
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
        }
    }
}

/// Name-based access policy applied on top of the policy document (in the
/// tool server) or the pattern policy (in the gateway). Names accept the
/// same `*` wildcards as gateway patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySectionConfig {
    #[serde(default, rename = "denyByDefault")]
    pub deny_by_default: bool,
    #[serde(default, rename = "allowedTools")]
    pub allowed_tools: Vec<String>,
    #[serde(default, rename = "deniedTools")]
    pub denied_tools: Vec<String>,
    /// Gateway only: restrict aggregation to these namespace prefixes.
    #[serde(default, rename = "allowedNamespaces")]
    pub allowed_namespaces: Vec<String>,
    /// When a descriptor cannot be resolved against the policy document,
    /// deny it (true, default) or fall through to the document default.
    #[serde(
        default = "default_true",
        rename = "denyOnPolicyEvaluationFailure"
    )]
    pub deny_on_policy_evaluation_failure: bool,
}

impl Default for PolicySectionConfig {
    fn default() -> Self {
        Self {
            deny_by_default: false,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            allowed_namespaces: Vec::new(),
            deny_on_policy_evaluation_failure: true,
        }
    }
}

/// In-process server wiring: the backend the executor talks to, the known
/// endpoint descriptors, and where the policy document comes from (inline
/// or a watched file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, rename = "backendBaseUrl")]
    pub backend_base_url: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
    #[serde(default)]
    pub policy: Option<PolicyDocument>,
    #[serde(default, rename = "policyFile")]
    pub policy_file: Option<String>,
    #[serde(default = "default_policy_refresh_secs", rename = "policyRefreshIntervalSecs")]
    pub policy_refresh_interval_secs: u64,
}

fn default_policy_refresh_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(
        default = "default_execution_timeout_secs",
        rename = "defaultExecutionTimeoutSeconds"
    )]
    pub default_execution_timeout_seconds: u64,
    #[serde(default, rename = "maxConcurrentActions")]
    pub max_concurrent_actions: Option<u32>,
    #[serde(default, rename = "rejectWhenOverCapacity")]
    pub reject_when_over_capacity: bool,
    #[serde(default = "default_max_queue_depth", rename = "maxQueueDepth")]
    pub max_queue_depth: u32,
    #[serde(default, rename = "enableRetry")]
    pub enable_retry: bool,
    #[serde(default = "default_retry_attempts", rename = "maxRetryAttempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms", rename = "retryDelayMilliseconds")]
    pub retry_delay_milliseconds: u64,
}

fn default_execution_timeout_secs() -> u64 {
    30
}

fn default_max_queue_depth() -> u32 {
    16
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    200
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            default_execution_timeout_seconds: default_execution_timeout_secs(),
            max_concurrent_actions: None,
            reject_when_over_capacity: false,
            max_queue_depth: default_max_queue_depth(),
            enable_retry: false,
            max_retry_attempts: default_retry_attempts(),
            retry_delay_milliseconds: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default = "default_separator", rename = "toolNameSeparator")]
    pub tool_name_separator: String,
    #[serde(default, rename = "allowedToolPatterns")]
    pub allowed_tool_patterns: Vec<String>,
    #[serde(default, rename = "deniedToolPatterns")]
    pub denied_tool_patterns: Vec<String>,
    #[serde(default, rename = "denyByDefault")]
    pub deny_by_default: bool,
    #[serde(
        default = "default_catalog_refresh_secs",
        rename = "catalogRefreshIntervalSecs"
    )]
    pub catalog_refresh_interval_secs: u64,
}

fn default_separator() -> String {
    ".".to_string()
}

fn default_catalog_refresh_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            tool_name_separator: default_separator(),
            allowed_tool_patterns: Vec::new(),
            denied_tool_patterns: Vec::new(),
            deny_by_default: false,
            catalog_refresh_interval_secs: default_catalog_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "defaultQuota")]
    pub default_quota: Option<Quota>,
    /// Pattern → quota. Exact names win over wildcard patterns.
    #[serde(default)]
    pub overrides: IndexMap<String, Quota>,
    #[serde(default = "default_max_cache_size", rename = "maxCacheSize")]
    pub max_cache_size: usize,
    #[serde(default = "default_cleanup_secs", rename = "cleanupIntervalSecs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_expiration_secs", rename = "entryExpirationSecs")]
    pub entry_expiration_secs: u64,
    #[serde(default = "default_tenant_header", rename = "tenantHeader")]
    pub tenant_header: String,
    #[serde(default = "default_user_header", rename = "userHeader")]
    pub user_header: String,
}

fn default_max_cache_size() -> usize {
    10_000
}

fn default_cleanup_secs() -> u64 {
    60
}

fn default_expiration_secs() -> u64 {
    600
}

fn default_tenant_header() -> String {
    "X-Tenant-Id".to_string()
}

fn default_user_header() -> String {
    "X-User-Id".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_quota: None,
            overrides: IndexMap::new(),
            max_cache_size: default_max_cache_size(),
            cleanup_interval_secs: default_cleanup_secs(),
            entry_expiration_secs: default_expiration_secs(),
            tenant_header: default_tenant_header(),
            user_header: default_user_header(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_max_body", rename = "maxRequestBodyBytes")]
    pub max_request_body_bytes: usize,
    #[serde(default = "default_max_depth", rename = "maxArgumentsJsonDepth")]
    pub max_arguments_json_depth: usize,
    #[serde(default = "default_max_props", rename = "maxArgumentsPropertyCount")]
    pub max_arguments_property_count: usize,
    #[serde(default = "default_true", rename = "includeCorrelationIdInErrors")]
    pub include_correlation_id_in_errors: bool,
}

fn default_max_body() -> usize {
    1024 * 1024
}

fn default_max_depth() -> usize {
    16
}

fn default_max_props() -> usize {
    128
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_request_body_bytes: default_max_body(),
            max_arguments_json_depth: default_max_depth(),
            max_arguments_property_count: default_max_props(),
            include_correlation_id_in_errors: true,
        }
    }
}

impl TransportConfig {
    pub fn limits(&self) -> TransportLimits {
        TransportLimits {
            max_body_bytes: self.max_request_body_bytes,
            max_arguments_depth: self.max_arguments_json_depth,
            max_arguments_properties: self.max_arguments_property_count,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "fieldNames")]
    pub field_names: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Root configuration document (JSON file, camelCase keys).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub policy: PolicySectionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Config {
    /// Structural validation. Errors make the config unusable; warnings are
    /// logged by the caller and the config is used anyway.
    pub fn validate(&self) -> ContextifyResult<Vec<String>> {
        let mut warnings = Vec::new();

        if self.gateway.tool_name_separator.is_empty() {
            return Err(ContextifyError::Config(
                "gateway.toolNameSeparator must not be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for upstream in &self.gateway.upstreams {
            if upstream.name.is_empty() {
                return Err(ContextifyError::Config(
                    "gateway.upstreams: upstream name must not be empty".to_string(),
                ));
            }
            if !seen.insert(&upstream.name) {
                return Err(ContextifyError::Config(format!(
                    "gateway.upstreams: duplicate upstream name '{}'",
                    upstream.name
                )));
            }
            if url::Url::parse(&upstream.mcp_http_endpoint).is_err() {
                return Err(ContextifyError::Config(format!(
                    "gateway.upstreams: '{}' has an invalid endpoint URL",
                    upstream.name
                )));
            }
            if upstream.namespace_prefix.is_empty() {
                warnings.push(format!(
                    "gateway.upstreams: '{}' has an empty namespace prefix; its tools keep their raw names",
                    upstream.name
                ));
            }
        }

        if let Some(quota) = &self.rate_limit.default_quota
            && let Err(e) = quota.validate()
        {
            return Err(ContextifyError::Config(format!(
                "rateLimit.defaultQuota: {}",
                e
            )));
        }
        for (pattern, quota) in &self.rate_limit.overrides {
            if let Err(e) = quota.validate() {
                return Err(ContextifyError::Config(format!(
                    "rateLimit.overrides['{}']: {}",
                    pattern, e
                )));
            }
        }
        if self.rate_limit.enabled
            && self.rate_limit.default_quota.is_none()
            && self.rate_limit.overrides.is_empty()
        {
            warnings.push(
                "rateLimit.enabled is set but no quotas are configured; rate limiting is a no-op"
                    .to_string(),
            );
        }

        if let Some(policy) = &self.server.policy {
            let report = policy.validate();
            if !report.is_ok() {
                return Err(ContextifyError::Config(format!(
                    "server.policy: {}",
                    report.errors.join("; ")
                )));
            }
            warnings.extend(report.warnings);
        }
        if self.server.policy.is_some() && self.server.policy_file.is_some() {
            warnings.push(
                "both server.policy and server.policyFile are set; the file wins".to_string(),
            );
        }

        if self.transport.max_request_body_bytes == 0 {
            return Err(ContextifyError::Config(
                "transport.maxRequestBodyBytes must be > 0".to_string(),
            ));
        }

        Ok(warnings)
    }

    pub fn application_name(&self) -> String {
        self.core
            .application_name
            .clone()
            .unwrap_or_else(|| "contextify".to_string())
    }
}

/// Load a config file, apply validation, and log warnings. A missing path
/// yields the defaults so the process can start bare.
pub fn load_config(path: Option<&Path>) -> ContextifyResult<Config> {
    let Some(path) = path else {
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    };

    let content = std::fs::read_to_string(path).map_err(|e| {
        ContextifyError::Config(format!("failed to read config {}: {}", path.display(), e))
    })?;
    let config: Config = serde_json::from_str(&content).map_err(|e| {
        ContextifyError::Config(format!("failed to parse config {}: {}", path.display(), e))
    })?;

    for warning in config.validate()? {
        warn!("config: {}", warning);
    }
    Ok(config)
}

/// Expand `${VAR}` references in upstream default headers from the process
/// environment, so secrets stay out of the config file.
pub fn expand_header_env(headers: &mut HashMap<String, String>) {
    for value in headers.values_mut() {
        if let Some(name) = value
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            match std::env::var(name) {
                Ok(resolved) => *value = resolved,
                Err(_) => warn!("config: environment variable '{}' is not set", name),
            }
        }
    }
}
