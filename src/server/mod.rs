/// In-process tool server: a policy-driven catalog of local HTTP endpoints
/// exposed over MCP, with the middleware pipeline wrapping every call.
use std::path::Path;
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
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::MANIFEST_PATH;
use crate::catalog::CatalogProvider;
use crate::config::Config;
use crate::errors::{ContextifyError, ContextifyResult};
use crate::executor::{HttpToolExecutor, default_http_client};
use crate::gateway::GatewayToolPolicy;
use crate::invocation::{FailureKind, Invocation, ToolOutcome};
use crate::pipeline::{
    AuthPropagationAction, ConcurrencyAction, Pipeline, RateLimitAction, RedactionAction,
    TimeoutAction,
};
use crate::policy::source::{FilePolicySource, InMemoryPolicySource};
use crate::policy::{EffectivePolicy, PolicySource};
use crate::ratelimit::LimiterCache;
use crate::redact::Redactor;
use crate::rpc::{self, CallContext, CallReply, RpcOptions, ToolHost, ToolSummary};

/// The in-process host: catalog provider, pipeline, executor, transport.
pub struct Server {
    name: String,
    version: String,
    provider: Arc<CatalogProvider>,
    /// Present when the policy document is embedded in the config file;
    /// config updates replace it through here.
    inline_policy: Option<Arc<InMemoryPolicySource>>,
    /// Name-based gate from the policy config section, applied on top of
    /// the policy document.
    name_policy: GatewayToolPolicy,
    pipeline: Pipeline,
    limiters: Arc<LimiterCache>,
    default_timeout: Duration,
    options: RpcOptions,
    tenant_header: String,
    user_header: String,
    enable_debug_endpoints: bool,
    cleanup_interval: Duration,
}

impl Server {
    pub fn from_config(config: &Config) -> ContextifyResult<Arc<Self>> {
        if config.server.backend_base_url.is_empty() && !config.server.endpoints.is_empty() {
            return Err(ContextifyError::Config(
                "server.backendBaseUrl is required when endpoints are configured".to_string(),
            ));
        }

        let mut inline_policy = None;
        let source: Arc<dyn PolicySource> = match &config.server.policy_file {
            Some(path) => Arc::new(
                FilePolicySource::start(Path::new(path))
                    .map_err(|e| ContextifyError::Config(e.to_string()))?,
            ),
            None => {
                let source = Arc::new(InMemoryPolicySource::new(
                    config.server.policy.clone().unwrap_or_default(),
                ));
                inline_policy = Some(source.clone());
                source
            }
        };

        let mut provider = CatalogProvider::new(
            source,
            config.server.endpoints.clone(),
            Duration::from_secs(config.server.policy_refresh_interval_secs.max(1)),
        );
        if !config.policy.deny_on_policy_evaluation_failure {
            provider = provider.with_evaluation_failure_fallback();
        }
        let provider = Arc::new(provider);

        let executor = Arc::new(HttpToolExecutor::new(
            default_http_client(),
            config.server.backend_base_url.clone(),
            provider.clone(),
        ));

        let limiters = Arc::new(LimiterCache::new(
            config.rate_limit.max_cache_size,
            Duration::from_secs(config.rate_limit.entry_expiration_secs.max(1)),
        ));
        let redactor = if config.redaction.enabled {
            Redactor::new(&config.redaction.field_names, &config.redaction.patterns)
        } else {
            Redactor::disabled()
        };

        let pipeline = Pipeline::new(
            vec![
                Arc::new(AuthPropagationAction),
                Arc::new(TimeoutAction),
                Arc::new(ConcurrencyAction::new()),
                Arc::new(RateLimitAction::new(limiters.clone())),
                Arc::new(RedactionAction::new(Arc::new(redactor))),
            ],
            executor,
        );

        Ok(Arc::new(Self {
            name: config.application_name(),
            version: config
                .core
                .application_version
                .clone()
                .unwrap_or_else(|| crate::VERSION.to_string()),
            provider,
            inline_policy,
            name_policy: GatewayToolPolicy::new(
                &config.policy.allowed_tools,
                &config.policy.denied_tools,
                config.policy.deny_by_default,
            ),
            pipeline,
            limiters,
            default_timeout: Duration::from_secs(
                config.actions.default_execution_timeout_seconds.max(1),
            ),
            options: RpcOptions {
                limits: config.transport.limits(),
                include_correlation_id: config.transport.include_correlation_id_in_errors,
            },
            tenant_header: config.rate_limit.tenant_header.clone(),
            user_header: config.rate_limit.user_header.clone(),
            enable_debug_endpoints: config.core.enable_debug_endpoints,
            cleanup_interval: Duration::from_secs(config.rate_limit.cleanup_interval_secs.max(1)),
        }))
    }

    pub fn provider(&self) -> &Arc<CatalogProvider> {
        &self.provider
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    /// Background work: policy change listener and limiter cleanup.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) {
        self.provider.spawn_change_listener(cancel.clone());
        self.limiters.spawn_cleanup(self.cleanup_interval, cancel);
    }

    /// Apply the dynamic parts of a configuration update: the endpoint set
    /// and, when the policy document is inline, the document itself, then
    /// rebuild the catalog. Listener and transport changes need a restart.
    pub async fn apply_config(&self, config: &Config) {
        self.provider
            .update_endpoints(config.server.endpoints.clone());
        if let (Some(source), Some(document)) = (&self.inline_policy, &config.server.policy) {
            source.set_document(document.clone());
        }
        self.provider.reload().await;
        info!(
            "configuration update applied: {} endpoint(s) known",
            config.server.endpoints.len()
        );
    }

    /// Consume updates from a [`crate::config::watcher::ConfigWatcher`]
    /// until `cancel` fires.
    pub fn spawn_config_listener(
        self: &Arc<Self>,
        mut updates: watch::Receiver<Arc<Config>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let fresh = updates.borrow_and_update().clone();
                        server.apply_config(&fresh).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ToolHost for Server {
    fn server_name(&self) -> String {
        self.name.clone()
    }

    fn server_version(&self) -> String {
        self.version.clone()
    }

    async fn list_tools(&self) -> Vec<ToolSummary> {
        let snapshot = self.provider.ensure_fresh().await;
        snapshot
            .tools
            .values()
            .filter(|tool| self.name_policy.allows(&tool.tool_name))
            .map(|tool| ToolSummary {
                name: tool.tool_name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect()
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Map<String, Value>,
        context: &CallContext,
    ) -> CallReply {
        if !self.name_policy.allows(tool_name) {
            return CallReply::Outcome(ToolOutcome::failure(
                FailureKind::PolicyDenied,
                format!("tool '{}' is denied by policy", tool_name),
            ));
        }

        let snapshot = self.provider.ensure_fresh().await;
        let Some(tool) = snapshot.get(tool_name) else {
            return CallReply::Outcome(ToolOutcome::failure(
                FailureKind::ToolNotFound,
                format!("tool '{}' not found", tool_name),
            ));
        };

        // The configured default applies when the policy sets no deadline.
        let mut policy: EffectivePolicy = tool.effective_policy.clone();
        if policy.timeout.is_none() {
            policy.timeout = Some(self.default_timeout);
        }

        let invocation = Invocation {
            tool_name: tool_name.to_string(),
            arguments,
            cancel: CancellationToken::new(),
            auth: context.auth.clone(),
            tenant_id: context.tenant_id.clone(),
            user_id: context.user_id.clone(),
            correlation_id: context.correlation_id.clone(),
        };

        CallReply::Outcome(self.pipeline.run(&invocation, &policy).await)
    }
}

async fn mcp_handler(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let context = crate::gateway::call_context_from_headers(
        &headers,
        &server.tenant_header,
        &server.user_header,
    );
    let response = rpc::handle(&*server, &server.options, &body, &context).await;
    crate::gateway::rpc_to_response(response)
}

async fn manifest_handler(State(server): State<Arc<Server>>) -> Response {
    axum::Json(json!({
        "name": server.name,
        "version": server.version,
        "capabilities": {"tools": {}},
    }))
    .into_response()
}

/// Debug view of the current catalog. Only mounted when debug endpoints
/// are enabled.
async fn tools_debug_handler(State(server): State<Arc<Server>>) -> Response {
    let snapshot = server.provider.snapshot();
    let tools: Vec<Value> = snapshot
        .tools
        .values()
        .map(|tool| {
            json!({
                "name": tool.tool_name,
                "enabled": tool.effective_policy.enabled,
                "timeoutMs": tool.effective_policy.timeout.map(|t| t.as_millis() as u64),
            })
        })
        .collect();
    axum::Json(json!({
        "policyVersion": snapshot.policy_source_version,
        "ageSecs": snapshot.age_secs(),
        "tools": tools,
    }))
    .into_response()
}

pub fn build_router(server: Arc<Server>) -> Router {
    let body_cap = server.options.limits.max_body_bytes.saturating_add(1024);
    let mut router = Router::new()
        .route("/mcp", post(mcp_handler))
        .route(MANIFEST_PATH, get(manifest_handler));
    if server.enable_debug_endpoints {
        router = router.route("/contextify/tools", get(tools_debug_handler));
    }
    router
        .layer(axum::extract::DefaultBodyLimit::max(body_cap))
        .with_state(server)
}

/// Serve the in-process host over HTTP until shutdown.
pub async fn serve_http(
    server: Arc<Server>,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> ContextifyResult<()> {
    server.provider.reload().await;
    server.spawn_background(cancel.clone());

    let app = build_router(server);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ContextifyError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!("tool server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| {
            error!("tool server error: {}", e);
            ContextifyError::Internal(anyhow::anyhow!(e))
        })
}

/// Serve the in-process host over stdio: one JSON-RPC envelope per line on
/// stdin, one response per line on stdout. Used when contextify runs as a
/// child process of an MCP client.
pub async fn serve_stdio(server: Arc<Server>, cancel: CancellationToken) -> ContextifyResult<()> {
    server.provider.reload().await;
    server.spawn_background(cancel.clone());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();
    info!("tool server on stdio");

    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdio read error: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = rpc::handle(
            &*server,
            &server.options,
            line.as_bytes(),
            &CallContext::default(),
        )
        .await;
        let mut rendered = response.body.to_string();
        rendered.push('\n');
        if let Err(e) = stdout.write_all(rendered.as_bytes()).await {
            warn!("stdio write error: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
