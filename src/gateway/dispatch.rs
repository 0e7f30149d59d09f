use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::gateway::aggregator::ToolRoute;
use crate::gateway::post_raw_jsonrpc;
use crate::gateway::upstream::Upstream;
use crate::invocation::{AuthContext, FailureKind, ToolOutcome};

/// Retry behavior for forwarded calls. The default is no retry; a fixed
/// delay variant is wired in when retries are enabled in configuration.
pub trait RetryPolicy: Send + Sync {
    /// Total attempts including the first one.
    fn max_attempts(&self) -> u32;
    fn delay(&self) -> Duration;
}

pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn max_attempts(&self) -> u32 {
        1
    }

    fn delay(&self) -> Duration {
        Duration::ZERO
    }
}

pub struct FixedDelayRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy for FixedDelayRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

/// Forwards a namespaced `tools/call` to its upstream as a fresh JSON-RPC
/// request. Emits start/end audit records carrying the correlation id.
pub struct GatewayDispatcher {
    client: reqwest::Client,
    retry: Box<dyn RetryPolicy>,
    forward_auth: bool,
}

impl GatewayDispatcher {
    pub fn new(client: reqwest::Client, retry: Box<dyn RetryPolicy>, forward_auth: bool) -> Self {
        Self {
            client,
            retry,
            forward_auth,
        }
    }

    pub async fn forward(
        &self,
        upstream: &Upstream,
        route: &ToolRoute,
        arguments: Map<String, Value>,
        auth: Option<&AuthContext>,
        correlation_id: &str,
    ) -> ToolOutcome {
        info!(
            "dispatch start: '{}' -> upstream '{}' tool '{}' [{}]",
            route.external_name, upstream.name, route.upstream_tool, correlation_id
        );

        let params = json!({
            "name": route.upstream_tool,
            "arguments": Value::Object(arguments),
        });

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let outcome = self.forward_once(upstream, &params, auth).await;
            let retryable = outcome
                .as_failure()
                .is_some_and(|f| f.transient && attempt < self.retry.max_attempts());
            if !retryable {
                break outcome;
            }
            warn!(
                "dispatch retry {}/{} for '{}' [{}]",
                attempt,
                self.retry.max_attempts(),
                route.external_name,
                correlation_id
            );
            tokio::time::sleep(self.retry.delay()).await;
        };

        info!(
            "dispatch end: '{}' [{}] success={}",
            route.external_name,
            correlation_id,
            outcome.is_success()
        );
        outcome
    }

    async fn forward_once(
        &self,
        upstream: &Upstream,
        params: &Value,
        auth: Option<&AuthContext>,
    ) -> ToolOutcome {
        let bearer = if self.forward_auth {
            auth.and_then(|a| a.bearer_token.as_deref())
        } else {
            None
        };

        let envelope = match post_raw_jsonrpc(
            &self.client,
            &upstream.mcp_http_endpoint,
            &upstream.default_headers,
            bearer,
            upstream.request_timeout(),
            "tools/call",
            params.clone(),
        )
        .await
        {
            Ok(envelope) => envelope,
            Err(e) => {
                return if e.starts_with("http: status 4") {
                    ToolOutcome::upstream_error(
                        parse_status(&e).unwrap_or(400),
                        format!("upstream '{}' rejected the call", upstream.name),
                    )
                } else if e.starts_with("http: status 5") {
                    ToolOutcome::upstream_error(
                        parse_status(&e).unwrap_or(500),
                        format!("upstream '{}' failed", upstream.name),
                    )
                } else if e.starts_with("parse:") {
                    ToolOutcome::failure(
                        FailureKind::ParseError,
                        format!("upstream '{}' produced a malformed response", upstream.name),
                    )
                } else {
                    // timeout or transport
                    ToolOutcome::failure(
                        FailureKind::UpstreamUnavailable,
                        format!("upstream '{}' is unreachable", upstream.name),
                    )
                };
            }
        };

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error");
            return ToolOutcome::failure(
                FailureKind::UpstreamError,
                format!("upstream '{}': {}", upstream.name, message),
            );
        }
        match envelope.get("result") {
            // The result is returned unchanged; only the id is ours.
            Some(result) => ToolOutcome::json(result.clone()),
            None => ToolOutcome::failure(
                FailureKind::ParseError,
                format!(
                    "upstream '{}' response had neither result nor error",
                    upstream.name
                ),
            ),
        }
    }
}

fn parse_status(error: &str) -> Option<u16> {
    error.rsplit(' ').next()?.parse().ok()
}
