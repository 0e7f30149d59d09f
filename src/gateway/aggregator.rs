use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::gateway::policy::GatewayToolPolicy;
use crate::gateway::upstream::{Upstream, UpstreamRegistry};
use crate::gateway::post_jsonrpc;

/// Mapping from an external (namespaced) tool name to its upstream.
#[derive(Debug, Clone)]
pub struct ToolRoute {
    pub external_name: String,
    pub upstream_name: String,
    pub upstream_tool: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// Result of the most recent contact with one upstream. Created per probe
/// and never mutated after publication.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(rename = "lastProbeUtc")]
    pub last_probe_utc: DateTime<Utc>,
    #[serde(rename = "latencyMs", skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(rename = "toolCount", skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable aggregated view over all upstreams.
#[derive(Debug)]
pub struct GatewaySnapshot {
    pub created_utc: DateTime<Utc>,
    pub routes: IndexMap<String, ToolRoute>,
    pub upstreams: Vec<UpstreamStatus>,
}

impl GatewaySnapshot {
    pub fn empty() -> Self {
        Self {
            created_utc: Utc::now(),
            routes: IndexMap::new(),
            upstreams: Vec::new(),
        }
    }

    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.created_utc).num_seconds()
    }

    /// Healthy flag from the aggregation pass, by upstream name.
    pub fn upstream_healthy(&self, name: &str) -> Option<bool> {
        self.upstreams
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.healthy)
    }
}

/// Minimum spacing between aggregation passes.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Builds and owns the gateway snapshot: parallel `tools/list` fan-out,
/// namespace prefixing, policy filtering, atomic swap. One upstream
/// failing never blocks the others (partial availability).
pub struct GatewayAggregator {
    client: reqwest::Client,
    registry: Arc<UpstreamRegistry>,
    policy: Arc<GatewayToolPolicy>,
    separator: String,
    current: RwLock<Arc<GatewaySnapshot>>,
    last_build: Mutex<Option<Instant>>,
    generation: AtomicU64,
    build_lock: tokio::sync::Mutex<()>,
    refresh_interval: Duration,
}

impl GatewayAggregator {
    pub fn new(
        client: reqwest::Client,
        registry: Arc<UpstreamRegistry>,
        policy: Arc<GatewayToolPolicy>,
        separator: impl Into<String>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            client,
            registry,
            policy,
            separator: separator.into(),
            current: RwLock::new(Arc::new(GatewaySnapshot::empty())),
            last_build: Mutex::new(None),
            generation: AtomicU64::new(0),
            build_lock: tokio::sync::Mutex::new(()),
            refresh_interval,
        }
    }

    pub fn snapshot(&self) -> Arc<GatewaySnapshot> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub async fn ensure_fresh(&self) -> Arc<GatewaySnapshot> {
        let stale = {
            let last = self
                .last_build
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last.is_none_or(|t| t.elapsed() >= self.refresh_interval)
        };
        if stale { self.refresh().await } else { self.snapshot() }
    }

    /// Rebuild the snapshot now. Single-flight; throttled to
    /// [`MIN_REFRESH_INTERVAL`].
    pub async fn refresh(&self) -> Arc<GatewaySnapshot> {
        {
            let last = self
                .last_build
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.is_some_and(|t| t.elapsed() < MIN_REFRESH_INTERVAL) {
                return self.snapshot();
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        let _guard = self.build_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != generation {
            return self.snapshot();
        }

        let snapshot = Arc::new(self.build().await);
        info!(
            "gateway catalog rebuilt: {} route(s) across {} upstream(s)",
            snapshot.routes.len(),
            snapshot.upstreams.len()
        );
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *current = snapshot.clone();
        }
        *self
            .last_build
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());
        self.generation.fetch_add(1, Ordering::AcqRel);
        snapshot
    }

    async fn build(&self) -> GatewaySnapshot {
        let mut tasks: JoinSet<(String, Result<(Vec<Value>, u64), String>)> = JoinSet::new();
        for upstream in self.registry.enabled() {
            let client = self.client.clone();
            let upstream = upstream.clone();
            tasks.spawn(async move {
                let name = upstream.name.clone();
                (name, fetch_upstream_tools(&client, &upstream).await)
            });
        }

        // Fan-in: arrival order is irrelevant, results are keyed by name
        // and materialized in registry order below.
        let mut results = std::collections::HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => {
                    results.insert(name, result);
                }
                Err(e) => warn!("gateway aggregation task failed: {}", e),
            }
        }

        let mut routes: IndexMap<String, ToolRoute> = IndexMap::new();
        let mut statuses = Vec::new();
        for upstream in self.registry.enabled() {
            let now = Utc::now();
            match results.remove(&upstream.name) {
                Some(Ok((tools, latency_ms))) => {
                    let mut kept = 0usize;
                    for tool in &tools {
                        let Some(raw_name) = tool.get("name").and_then(Value::as_str) else {
                            debug!(
                                "upstream '{}': dropping tool without a name",
                                upstream.name
                            );
                            continue;
                        };
                        let external_name = self.external_name(upstream, raw_name);
                        if !self.policy.allows(&external_name) {
                            debug!(
                                "upstream '{}': tool '{}' filtered by gateway policy",
                                upstream.name, external_name
                            );
                            continue;
                        }
                        if routes.contains_key(&external_name) {
                            warn!(
                                "duplicate external tool name '{}'; upstream '{}' wins",
                                external_name, upstream.name
                            );
                        }
                        routes.insert(
                            external_name.clone(),
                            ToolRoute {
                                external_name,
                                upstream_name: upstream.name.clone(),
                                upstream_tool: raw_name.to_string(),
                                description: tool
                                    .get("description")
                                    .and_then(Value::as_str)
                                    .map(String::from),
                                input_schema: tool.get("inputSchema").cloned(),
                            },
                        );
                        kept += 1;
                    }
                    statuses.push(UpstreamStatus {
                        name: upstream.name.clone(),
                        healthy: true,
                        last_probe_utc: now,
                        latency_ms: Some(latency_ms),
                        tool_count: Some(kept),
                        error: None,
                    });
                }
                Some(Err(error)) => {
                    warn!("upstream '{}' unavailable: {}", upstream.name, error);
                    statuses.push(UpstreamStatus {
                        name: upstream.name.clone(),
                        healthy: false,
                        last_probe_utc: now,
                        latency_ms: None,
                        tool_count: None,
                        error: Some(error),
                    });
                }
                None => {
                    statuses.push(UpstreamStatus {
                        name: upstream.name.clone(),
                        healthy: false,
                        last_probe_utc: now,
                        latency_ms: None,
                        tool_count: None,
                        error: Some("aggregation task lost".to_string()),
                    });
                }
            }
        }

        GatewaySnapshot {
            created_utc: Utc::now(),
            routes,
            upstreams: statuses,
        }
    }

    fn external_name(&self, upstream: &Upstream, tool: &str) -> String {
        if upstream.namespace_prefix.is_empty() {
            tool.to_string()
        } else {
            format!("{}{}{}", upstream.namespace_prefix, self.separator, tool)
        }
    }
}

/// One `tools/list` exchange with an upstream. Any failure — timeout,
/// non-2xx, transport, parse — comes back as an error string for the
/// status record.
async fn fetch_upstream_tools(
    client: &reqwest::Client,
    upstream: &Upstream,
) -> Result<(Vec<Value>, u64), String> {
    let started = std::time::Instant::now();
    let result = post_jsonrpc(
        client,
        &upstream.mcp_http_endpoint,
        &upstream.default_headers,
        upstream.request_timeout(),
        "tools/list",
        json!({}),
    )
    .await?;
    let latency_ms = started.elapsed().as_millis() as u64;

    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| "parse: tools/list result missing 'tools' array".to_string())?;
    Ok((tools, latency_ms))
}
