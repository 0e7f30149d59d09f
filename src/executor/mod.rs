use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::catalog::CatalogProvider;
use crate::invocation::{
    AuthContext, DEFAULT_API_KEY_HEADER, FailureKind, Invocation, ToolOutcome,
};
use crate::pipeline::ToolDispatcher;
use crate::policy::{AuthPropagationMode, EffectivePolicy};

/// Build a `reqwest::Client` with standard timeouts (10 s connect, 30 s
/// overall). Shared across all calls; never built per request.
pub fn default_http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Terminal pipeline stage for the in-process subsystem: maps a tool call
/// onto an HTTP request against the local backend.
pub struct HttpToolExecutor {
    client: Client,
    base_url: String,
    provider: Arc<CatalogProvider>,
}

impl HttpToolExecutor {
    pub fn new(client: Client, base_url: impl Into<String>, provider: Arc<CatalogProvider>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            provider,
        }
    }
}

/// Expand `{name}` placeholders in a route template. Consumed argument
/// names are returned so the caller can route the leftovers.
fn expand_route(
    template: &str,
    arguments: &Map<String, Value>,
) -> Result<(String, Vec<String>), String> {
    let mut path = String::with_capacity(template.len());
    let mut consumed = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        path.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let Some(close) = tail.find('}') else {
            return Err(format!("unbalanced '{{' in route template '{}'", template));
        };
        let name = &tail[..close];
        let Some(value) = arguments.get(name) else {
            return Err(format!("missing argument for route parameter '{}'", name));
        };
        path.push_str(&scalar_to_string(value));
        consumed.push(name.to_string());
        rest = &tail[close + 1..];
    }
    path.push_str(rest);
    Ok((path, consumed))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Inject caller credentials per the propagation mode. `infer` picks the
/// strongest mechanism the context actually carries.
fn apply_auth(
    mut request: RequestBuilder,
    mode: AuthPropagationMode,
    auth: Option<&AuthContext>,
) -> RequestBuilder {
    let Some(auth) = auth else {
        return request;
    };
    let mode = match mode {
        AuthPropagationMode::Infer => {
            if auth.bearer_token.is_some() {
                AuthPropagationMode::Bearer
            } else if auth.api_key.is_some() {
                AuthPropagationMode::ApiKey
            } else if auth.cookies.is_some() {
                AuthPropagationMode::Cookies
            } else if !auth.additional_headers.is_empty() {
                AuthPropagationMode::AdditionalHeaders
            } else {
                AuthPropagationMode::None
            }
        }
        explicit => explicit,
    };
    match mode {
        AuthPropagationMode::None | AuthPropagationMode::Infer => {}
        AuthPropagationMode::Bearer => {
            if let Some(token) = &auth.bearer_token {
                request = request.header("Authorization", format!("Bearer {}", token));
            }
        }
        AuthPropagationMode::ApiKey => {
            if let Some(key) = &auth.api_key {
                let header = auth
                    .api_key_header
                    .as_deref()
                    .unwrap_or(DEFAULT_API_KEY_HEADER);
                request = request.header(header, key);
            }
        }
        AuthPropagationMode::Cookies => {
            if let Some(cookies) = &auth.cookies {
                request = request.header("Cookie", cookies);
            }
        }
        AuthPropagationMode::AdditionalHeaders => {
            for (name, value) in &auth.additional_headers {
                request = request.header(name, value);
            }
        }
    }
    request
}

#[async_trait]
impl ToolDispatcher for HttpToolExecutor {
    async fn dispatch(&self, invocation: &Invocation, policy: &EffectivePolicy) -> ToolOutcome {
        let snapshot = self.provider.snapshot();
        let Some(tool) = snapshot.get(&invocation.tool_name) else {
            return ToolOutcome::failure(
                FailureKind::ToolNotFound,
                format!("tool '{}' not found", invocation.tool_name),
            );
        };
        let endpoint = &tool.endpoint;

        let template = endpoint
            .route_template
            .clone()
            .unwrap_or_else(|| format!("/{}", invocation.tool_name));
        let (path, consumed) = match expand_route(&template, &invocation.arguments) {
            Ok(expanded) => expanded,
            Err(message) => {
                return ToolOutcome::failure(FailureKind::InvalidArgument, message);
            }
        };

        // Leftover arguments: primitives become query-string pairs,
        // structured values are gathered into one JSON body.
        let mut query: Vec<(String, String)> = Vec::new();
        let mut body = Map::new();
        for (name, value) in &invocation.arguments {
            if consumed.iter().any(|c| c == name) {
                continue;
            }
            match value {
                Value::Object(_) | Value::Array(_) => {
                    body.insert(name.clone(), value.clone());
                }
                Value::Null => {}
                scalar => query.push((name.clone(), scalar_to_string(scalar))),
            }
        }

        let method_str = endpoint.http_method.as_deref().unwrap_or("GET");
        let Ok(method) = Method::from_bytes(method_str.to_uppercase().as_bytes()) else {
            return ToolOutcome::failure(
                FailureKind::InvalidArgument,
                format!("unsupported HTTP method '{}'", method_str),
            );
        };

        let mut url = format!("{}{}", self.base_url, path);
        if !query.is_empty() {
            let encoded = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&query)
                .finish();
            url.push('?');
            url.push_str(&encoded);
        }

        let mut request = self.client.request(method, &url);
        request = apply_auth(request, policy.auth_propagation, invocation.auth.as_ref());
        if !body.is_empty() {
            request = request.json(&Value::Object(body));
        }

        debug!(
            "tool '{}': {} {} [{}]",
            invocation.tool_name, method_str, url, invocation.correlation_id
        );

        let response = tokio::select! {
            () = invocation.cancel.cancelled() => {
                return ToolOutcome::failure(FailureKind::Cancelled, "invocation cancelled");
            }
            sent = request.send() => match sent {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(
                        "tool '{}': transport error [{}]: {}",
                        invocation.tool_name, invocation.correlation_id, e
                    );
                    return ToolOutcome::failure(
                        FailureKind::UpstreamUnavailable,
                        format!("backend unreachable for tool '{}'", invocation.tool_name),
                    );
                }
            },
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body_text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return ToolOutcome::failure(
                    FailureKind::ParseError,
                    format!("failed to read backend response: {}", e),
                );
            }
        };

        if status.is_client_error() || status.is_server_error() {
            return ToolOutcome::upstream_error(
                status.as_u16(),
                format!(
                    "backend returned HTTP {} for tool '{}'",
                    status.as_u16(),
                    invocation.tool_name
                ),
            );
        }

        if content_type.contains("json") {
            match serde_json::from_str::<Value>(&body_text) {
                Ok(json) => ToolOutcome::json(json),
                Err(e) => ToolOutcome::failure(
                    FailureKind::ParseError,
                    format!("backend produced malformed JSON: {}", e),
                ),
            }
        } else {
            ToolOutcome::text(body_text)
        }
    }
}
