use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::MANIFEST_PATH;
use crate::gateway::post_jsonrpc;
use crate::gateway::upstream::{Upstream, UpstreamRegistry};

/// Outcome of the most recent probe of one upstream.
#[derive(Debug, Clone)]
pub struct ProbeStatus {
    pub healthy: bool,
    pub last_probe_utc: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Probes upstream health: the manifest document first, a JSON-RPC
/// `tools/list` as fallback. Pass/fail per cycle; a failed upstream stays
/// registered and is probed again next round.
pub struct HealthMonitor {
    client: reqwest::Client,
    statuses: RwLock<HashMap<String, ProbeStatus>>,
}

impl HealthMonitor {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Latest probe result for an upstream, if it has been probed at all.
    pub fn status(&self, name: &str) -> Option<ProbeStatus> {
        self.statuses
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn is_healthy(&self, name: &str) -> Option<bool> {
        self.status(name).map(|s| s.healthy)
    }

    /// Probe every enabled upstream in parallel and publish the results.
    pub async fn probe_all(&self, registry: &UpstreamRegistry) {
        let mut tasks: JoinSet<(String, ProbeStatus)> = JoinSet::new();
        for upstream in registry.enabled() {
            let client = self.client.clone();
            let upstream = upstream.clone();
            tasks.spawn(async move {
                let name = upstream.name.clone();
                (name, probe_one(&client, &upstream).await)
            });
        }

        let mut fresh = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((name, status)) = joined {
                if !status.healthy {
                    warn!(
                        "upstream '{}' probe failed: {}",
                        name,
                        status.error.as_deref().unwrap_or("unknown")
                    );
                }
                fresh.insert(name, status);
            }
        }

        let mut statuses = self
            .statuses
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        statuses.extend(fresh);
    }

    /// Periodic probing until `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        registry: Arc<UpstreamRegistry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.probe_all(&registry).await,
                }
            }
        })
    }
}

/// Manifest probe first, MCP probe as fallback. Healthy means a 2xx
/// parseable response within the upstream's timeout.
async fn probe_one(client: &reqwest::Client, upstream: &Upstream) -> ProbeStatus {
    let started = std::time::Instant::now();

    if let Some(base) = upstream.base_url() {
        let manifest_url = format!("{}{}", base, MANIFEST_PATH);
        match manifest_probe(client, &manifest_url, upstream.request_timeout()).await {
            Ok(()) => {
                return ProbeStatus {
                    healthy: true,
                    last_probe_utc: Utc::now(),
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                    error: None,
                };
            }
            Err(e) => {
                debug!(
                    "upstream '{}': manifest probe failed ({}), falling back to tools/list",
                    upstream.name, e
                );
            }
        }
    }

    match post_jsonrpc(
        client,
        &upstream.mcp_http_endpoint,
        &upstream.default_headers,
        upstream.request_timeout(),
        "tools/list",
        json!({}),
    )
    .await
    {
        Ok(_) => ProbeStatus {
            healthy: true,
            last_probe_utc: Utc::now(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => ProbeStatus {
            healthy: false,
            last_probe_utc: Utc::now(),
            latency_ms: None,
            error: Some(e),
        },
    }
}

async fn manifest_probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<(), String> {
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|e| format!("transport: {}", e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("http: status {}", status.as_u16()));
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| format!("parse: {}", e))?;
    Ok(())
}
