use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// One remote MCP server aggregated by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    /// Unique name; also the registry key.
    pub name: String,
    /// Prefix applied to every tool from this upstream. Need not be unique.
    #[serde(rename = "namespacePrefix")]
    pub namespace_prefix: String,
    /// Full URL of the upstream's JSON-RPC endpoint.
    #[serde(rename = "mcpHttpEndpoint")]
    pub mcp_http_endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_request_timeout_ms", rename = "requestTimeoutMs")]
    pub request_timeout_ms: u64,
    /// Headers copied onto every request to this upstream.
    #[serde(default, rename = "defaultHeaders")]
    pub default_headers: HashMap<String, String>,
}

impl Upstream {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    /// Base URL of the upstream host, for non-MCP probes like the manifest.
    pub fn base_url(&self) -> Option<String> {
        let parsed = url::Url::parse(&self.mcp_http_endpoint).ok()?;
        let mut base = format!("{}://{}", parsed.scheme(), parsed.host_str()?);
        if let Some(port) = parsed.port() {
            base.push_str(&format!(":{}", port));
        }
        Some(base)
    }
}

/// The set of configured upstreams. Immutable after startup; health and
/// catalog state live elsewhere.
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    upstreams: Vec<Upstream>,
}

impl UpstreamRegistry {
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        Self { upstreams }
    }

    pub fn get(&self, name: &str) -> Option<&Upstream> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    /// Upstreams participating in aggregation and health probing.
    pub fn enabled(&self) -> impl Iterator<Item = &Upstream> {
        self.upstreams.iter().filter(|u| u.enabled)
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
