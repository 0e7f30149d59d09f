/// Multi-upstream MCP gateway: aggregates several MCP servers into one
/// virtual endpoint behind namespace prefixes, wildcard tool policy,
/// scope-based rate limiting, and health-gated dispatch.
pub mod aggregator;
pub mod dispatch;
pub mod health;
pub mod policy;
pub mod rate_limit;
pub mod upstream;

pub use aggregator::{GatewayAggregator, GatewaySnapshot, ToolRoute, UpstreamStatus};
pub use dispatch::{FixedDelayRetry, GatewayDispatcher, NoRetry, RetryPolicy};
pub use health::HealthMonitor;
pub use policy::GatewayToolPolicy;
pub use rate_limit::{GatewayRateLimiter, RateDecision};
pub use upstream::{Upstream, UpstreamRegistry};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::MANIFEST_PATH;
use crate::config::Config;
use crate::errors::{ContextifyError, ContextifyResult};
use crate::executor::default_http_client;
use crate::invocation::{AuthContext, FailureKind, ToolOutcome};
use crate::rpc::{self, CallContext, CallReply, RpcOptions, RpcResponse, ToolHost, ToolSummary};

/// POST a JSON-RPC request and return the whole response envelope. Errors
/// are strings prefixed with their failure mode (`timeout:`, `transport:`,
/// `http:`, `parse:`) so callers can classify without re-parsing.
pub(crate) async fn post_raw_jsonrpc(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    bearer: Option<&str>,
    timeout: Duration,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    let envelope = json!({
        "jsonrpc": "2.0",
        "id": uuid::Uuid::new_v4().to_string(),
        "method": method,
        "params": params,
    });

    let mut request = client.post(url).json(&envelope);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(token) = bearer {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| format!("timeout: no response within {} ms", timeout.as_millis()))?
        .map_err(|e| format!("transport: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("http: status {}", status.as_u16()));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| format!("parse: {}", e))
}

/// POST a JSON-RPC request and return its `result`, treating a JSON-RPC
/// error object as a failure.
pub(crate) async fn post_jsonrpc(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    timeout: Duration,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    let envelope = post_raw_jsonrpc(client, url, headers, None, timeout, method, params).await?;
    if let Some(error) = envelope.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(format!("rpc: {}", message));
    }
    envelope
        .get("result")
        .cloned()
        .ok_or_else(|| "parse: response had neither result nor error".to_string())
}

/// The gateway host: everything one virtual MCP endpoint needs.
pub struct Gateway {
    name: String,
    version: String,
    registry: Arc<UpstreamRegistry>,
    policy: Arc<GatewayToolPolicy>,
    aggregator: Arc<GatewayAggregator>,
    health: Arc<HealthMonitor>,
    dispatcher: GatewayDispatcher,
    rate_limiter: GatewayRateLimiter,
    options: RpcOptions,
    tenant_header: String,
    user_header: String,
    refresh_interval: Duration,
    cleanup_interval: Duration,
}

impl Gateway {
    /// Wire the gateway from configuration. Fails when no upstreams are
    /// configured — a gateway with nothing to aggregate is a startup error.
    pub fn from_config(config: &Config) -> ContextifyResult<Arc<Self>> {
        if config.gateway.upstreams.is_empty() {
            return Err(ContextifyError::Config(
                "gateway requires at least one upstream".to_string(),
            ));
        }

        let mut upstreams = config.gateway.upstreams.clone();
        for upstream in &mut upstreams {
            crate::config::expand_header_env(&mut upstream.default_headers);
        }
        let registry = Arc::new(UpstreamRegistry::new(upstreams));

        // The name-based policy section folds into the pattern policy:
        // allowed namespaces become prefix patterns and force
        // deny-by-default so everything outside them is closed off.
        let separator = &config.gateway.tool_name_separator;
        let mut allowed = config.gateway.allowed_tool_patterns.clone();
        allowed.extend(config.policy.allowed_tools.iter().cloned());
        allowed.extend(
            config
                .policy
                .allowed_namespaces
                .iter()
                .map(|ns| format!("{}{}*", ns, separator)),
        );
        let mut denied = config.gateway.denied_tool_patterns.clone();
        denied.extend(config.policy.denied_tools.iter().cloned());
        let deny_by_default = config.gateway.deny_by_default
            || config.policy.deny_by_default
            || !config.policy.allowed_namespaces.is_empty();
        let policy = Arc::new(GatewayToolPolicy::new(&allowed, &denied, deny_by_default));
        let client = default_http_client();
        let refresh_interval = Duration::from_secs(config.gateway.catalog_refresh_interval_secs);
        let aggregator = Arc::new(GatewayAggregator::new(
            client.clone(),
            registry.clone(),
            policy.clone(),
            config.gateway.tool_name_separator.clone(),
            refresh_interval,
        ));

        let retry: Box<dyn RetryPolicy> = if config.actions.enable_retry {
            Box::new(FixedDelayRetry {
                attempts: config.actions.max_retry_attempts.max(1),
                delay: Duration::from_millis(config.actions.retry_delay_milliseconds),
            })
        } else {
            Box::new(NoRetry)
        };

        Ok(Arc::new(Self {
            name: config.application_name(),
            version: config
                .core
                .application_version
                .clone()
                .unwrap_or_else(|| crate::VERSION.to_string()),
            registry: registry.clone(),
            policy,
            aggregator,
            health: Arc::new(HealthMonitor::new(client.clone())),
            dispatcher: GatewayDispatcher::new(client, retry, true),
            rate_limiter: GatewayRateLimiter::new(&config.rate_limit),
            options: RpcOptions {
                limits: config.transport.limits(),
                include_correlation_id: config.transport.include_correlation_id_in_errors,
            },
            tenant_header: config.rate_limit.tenant_header.clone(),
            user_header: config.rate_limit.user_header.clone(),
            refresh_interval,
            cleanup_interval: Duration::from_secs(config.rate_limit.cleanup_interval_secs.max(1)),
        }))
    }

    pub fn aggregator(&self) -> &Arc<GatewayAggregator> {
        &self.aggregator
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    /// Background work: health probing, catalog refresh, limiter cleanup.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) {
        self.health
            .spawn(self.registry.clone(), self.refresh_interval, cancel.clone());
        self.rate_limiter
            .cache()
            .spawn_cleanup(self.cleanup_interval, cancel.clone());

        let aggregator = self.aggregator.clone();
        let refresh = self.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        aggregator.ensure_fresh().await;
                    }
                }
            }
        });
    }

    fn diagnostics(&self) -> Value {
        let snapshot = self.aggregator.snapshot();
        json!({
            "catalogAgeSecs": snapshot.age_secs(),
            "toolCount": snapshot.routes.len(),
            "policyActive": self.policy.is_active(),
            "upstreams": snapshot.upstreams,
        })
    }
}

#[async_trait]
impl ToolHost for Gateway {
    fn server_name(&self) -> String {
        self.name.clone()
    }

    fn server_version(&self) -> String {
        self.version.clone()
    }

    async fn list_tools(&self) -> Vec<ToolSummary> {
        let snapshot = self.aggregator.ensure_fresh().await;
        snapshot
            .routes
            .values()
            .map(|route| ToolSummary {
                name: route.external_name.clone(),
                description: route.description.clone(),
                input_schema: route.input_schema.clone(),
            })
            .collect()
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Map<String, Value>,
        context: &CallContext,
    ) -> CallReply {
        // Rate limiting runs before everything else on the call path.
        match self
            .rate_limiter
            .check(
                tool_name,
                context.tenant_id.as_deref(),
                context.user_id.as_deref(),
            )
            .await
        {
            RateDecision::Denied {
                limit,
                window_ms,
                retry_after_secs,
            } => {
                return CallReply::HttpRateLimited {
                    limit,
                    window_ms,
                    retry_after_secs,
                };
            }
            RateDecision::Allowed | RateDecision::Bypassed => {}
        }

        // The pattern policy is re-applied at dispatch time so a tool that
        // vanished from (or was newly denied in) the catalog between
        // refreshes is handled deterministically.
        if !self.policy.allows(tool_name) {
            return CallReply::Outcome(ToolOutcome::failure(
                FailureKind::PolicyDenied,
                format!("tool '{}' is denied by gateway policy", tool_name),
            ));
        }

        let snapshot = self.aggregator.ensure_fresh().await;
        let Some(route) = snapshot.routes.get(tool_name) else {
            return CallReply::Outcome(ToolOutcome::failure(
                FailureKind::ToolNotFound,
                format!("tool '{}' not found", tool_name),
            ));
        };

        let Some(upstream) = self.registry.get(&route.upstream_name) else {
            return CallReply::Outcome(ToolOutcome::failure(
                FailureKind::UpstreamUnavailable,
                format!("upstream '{}' is not registered", route.upstream_name),
            ));
        };

        let healthy = self
            .health
            .is_healthy(&upstream.name)
            .or_else(|| snapshot.upstream_healthy(&upstream.name))
            .unwrap_or(true);
        if !healthy {
            return CallReply::Outcome(ToolOutcome::failure(
                FailureKind::UpstreamUnavailable,
                format!("upstream '{}' is currently unhealthy", upstream.name),
            ));
        }

        let outcome = self
            .dispatcher
            .forward(
                upstream,
                route,
                arguments,
                context.auth.as_ref(),
                &context.correlation_id,
            )
            .await;
        CallReply::Outcome(outcome)
    }
}

/// Extract caller identity from request headers. Shared with the
/// in-process host, whose transport surface is identical.
pub(crate) fn call_context_from_headers(
    headers: &HeaderMap,
    tenant_header: &str,
    user_header: &str,
) -> CallContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };

    let bearer_token = header("authorization")
        .and_then(|v| v.strip_prefix("Bearer ").map(String::from));
    let api_key = header("x-api-key");
    let cookies = header("cookie");
    let auth = (bearer_token.is_some() || api_key.is_some() || cookies.is_some()).then(|| {
        AuthContext {
            bearer_token,
            api_key,
            api_key_header: None,
            cookies,
            additional_headers: HashMap::new(),
        }
    });

    CallContext {
        auth,
        tenant_id: header(tenant_header),
        user_id: header(user_header),
        correlation_id: String::new(),
    }
}

pub(crate) fn rpc_to_response(rpc: RpcResponse) -> Response {
    let mut response = (rpc.status, axum::Json(rpc.body)).into_response();
    for (name, value) in rpc.headers {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

async fn mcp_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let context =
        call_context_from_headers(&headers, &gateway.tenant_header, &gateway.user_header);
    let response = rpc::handle(&*gateway, &gateway.options, &body, &context).await;
    rpc_to_response(response)
}

async fn manifest_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    axum::Json(json!({
        "name": gateway.name,
        "version": gateway.version,
        "capabilities": {"tools": {}},
    }))
    .into_response()
}

async fn diagnostics_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    axum::Json(gateway.diagnostics()).into_response()
}

/// Build the gateway HTTP router.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let body_cap = gateway.options.limits.max_body_bytes.saturating_add(1024);
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route(MANIFEST_PATH, get(manifest_handler))
        .route("/contextify/gateway/diagnostics", get(diagnostics_handler))
        .layer(axum::extract::DefaultBodyLimit::max(body_cap))
        .with_state(gateway)
}

/// Serve the gateway until shutdown. Performs the initial aggregation and
/// health probe before accepting traffic.
pub async fn serve(
    gateway: Arc<Gateway>,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> ContextifyResult<()> {
    gateway.health.probe_all(&gateway.registry).await;
    gateway.aggregator.refresh().await;
    gateway.spawn_background(cancel.clone());

    let app = build_router(gateway);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ContextifyError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!("gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| {
            error!("gateway server error: {}", e);
            ContextifyError::Internal(anyhow::anyhow!(e))
        })
}
