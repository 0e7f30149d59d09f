pub mod validate;

pub use validate::{TransportLimits, validate_arguments, validate_tool_name};

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::invocation::{AuthContext, ToolOutcome, new_correlation_id};

/// MCP protocol revision both hosts advertise from `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;
pub const CODE_RESOURCE_LIMITED: i64 = -32001;

/// Incoming JSON-RPC 2.0 envelope. Parsed once; downstream stages receive
/// the typed request, never the raw body.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// One tool as presented by `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// Transport-supplied caller identity, extracted from request headers.
/// The correlation id is stamped by the handler before the host sees the
/// call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub auth: Option<AuthContext>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub correlation_id: String,
}

/// Reply from a host's `call_tool`. The transport-level rate limit variant
/// exists so the gateway can answer HTTP 429 with limit headers instead of
/// a plain JSON-RPC error.
#[derive(Debug)]
pub enum CallReply {
    Outcome(ToolOutcome),
    HttpRateLimited {
        limit: u32,
        window_ms: u64,
        retry_after_secs: u64,
    },
}

/// The surface both subsystems implement: the in-process server backs it
/// with catalog + pipeline + executor, the gateway with policy + routes +
/// dispatcher.
#[async_trait]
pub trait ToolHost: Send + Sync {
    fn server_name(&self) -> String;

    /// Version advertised from `initialize`; defaults to the crate version.
    fn server_version(&self) -> String {
        crate::VERSION.to_string()
    }

    async fn list_tools(&self) -> Vec<ToolSummary>;

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Map<String, Value>,
        context: &CallContext,
    ) -> CallReply;
}

/// Knobs for the shared handler.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub limits: TransportLimits,
    pub include_correlation_id: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            limits: TransportLimits::default(),
            include_correlation_id: true,
        }
    }
}

/// Fully rendered response: status, JSON body, extra headers.
#[derive(Debug)]
pub struct RpcResponse {
    pub status: StatusCode,
    pub body: Value,
    pub headers: Vec<(&'static str, String)>,
}

impl RpcResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            headers: Vec::new(),
        }
    }
}

fn result_response(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_response(id: &Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({"jsonrpc": "2.0", "id": id, "error": error})
}

/// Render a tool outcome into a JSON-RPC response body.
fn outcome_response(id: &Value, outcome: ToolOutcome, correlation_id: Option<&str>) -> Value {
    match outcome {
        ToolOutcome::Success(content) => {
            // A result that is already MCP-shaped (a forwarded upstream
            // reply) passes through unchanged except for the id.
            if let Some(json) = &content.json
                && json.get("content").is_some_and(Value::is_array)
            {
                return result_response(id, json.clone());
            }
            // Otherwise JSON content is preferred; text is the fallback.
            let text = content
                .json
                .as_ref()
                .map(|j| serde_json::to_string(j).unwrap_or_default())
                .or(content.text)
                .unwrap_or_default();
            result_response(
                id,
                json!({"content": [{"type": "text", "text": text}], "isError": false}),
            )
        }
        ToolOutcome::Failure(failure) => {
            let mut data = json!({
                "code": failure.kind.code(),
                "transient": failure.transient,
            });
            if let Some(retry) = failure.retry_after_secs {
                data["retryAfterSec"] = json!(retry);
            }
            if let Some(correlation_id) = correlation_id {
                data["correlationId"] = json!(correlation_id);
            }
            error_response(id, failure.kind.rpc_code(), &failure.message, Some(data))
        }
    }
}

/// Handle one POSTed JSON-RPC request body end to end: size gate, parse,
/// envelope checks, method dispatch, error mapping. Every failure path
/// produces a well-formed JSON-RPC response; nothing here leaks exception
/// text, stack traces, or paths.
pub async fn handle(
    host: &dyn ToolHost,
    options: &RpcOptions,
    body: &[u8],
    context: &CallContext,
) -> RpcResponse {
    if body.len() > options.limits.max_body_bytes {
        return RpcResponse {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            body: error_response(
                &Value::Null,
                CODE_INVALID_PARAMS,
                &format!(
                    "request body exceeds maximum allowed size of {} bytes",
                    options.limits.max_body_bytes
                ),
                None,
            ),
            headers: Vec::new(),
        };
    }

    let parsed: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => {
            return RpcResponse::ok(error_response(
                &Value::Null,
                CODE_PARSE_ERROR,
                "Parse error",
                None,
            ));
        }
    };
    let request: RpcRequest = match serde_json::from_value(parsed) {
        Ok(request) => request,
        Err(_) => {
            return RpcResponse::ok(error_response(
                &Value::Null,
                CODE_INVALID_REQUEST,
                "Invalid Request",
                None,
            ));
        }
    };

    let id = request.id.unwrap_or(Value::Null);
    if request.jsonrpc.as_deref() != Some("2.0") {
        return RpcResponse::ok(error_response(
            &id,
            CODE_INVALID_REQUEST,
            "Invalid Request: jsonrpc must be \"2.0\"",
            None,
        ));
    }
    let Some(method) = request.method else {
        return RpcResponse::ok(error_response(
            &id,
            CODE_INVALID_REQUEST,
            "Invalid Request: method is required",
            None,
        ));
    };

    match method.as_str() {
        "initialize" => RpcResponse::ok(result_response(
            &id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": host.server_name(), "version": host.server_version()},
                "capabilities": {"tools": {}}
            }),
        )),
        "tools/list" => {
            let tools: Vec<Value> = host
                .list_tools()
                .await
                .into_iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description.unwrap_or_default(),
                        "inputSchema": tool
                            .input_schema
                            .unwrap_or_else(|| json!({"type": "object"})),
                    })
                })
                .collect();
            RpcResponse::ok(result_response(&id, json!({"tools": tools})))
        }
        "tools/call" => handle_call(host, options, &id, request.params, context).await,
        other => {
            debug!("unknown JSON-RPC method '{}'", other);
            RpcResponse::ok(error_response(
                &id,
                CODE_METHOD_NOT_FOUND,
                "Method not found",
                None,
            ))
        }
    }
}

async fn handle_call(
    host: &dyn ToolHost,
    options: &RpcOptions,
    id: &Value,
    params: Option<Value>,
    context: &CallContext,
) -> RpcResponse {
    let params = params.unwrap_or_else(|| json!({}));
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return RpcResponse::ok(error_response(
            id,
            CODE_INVALID_PARAMS,
            "validation failed: params.name is required",
            None,
        ));
    };
    if let Err(message) = validate_tool_name(name) {
        return RpcResponse::ok(error_response(
            id,
            CODE_INVALID_PARAMS,
            &format!("validation failed: {}", message),
            None,
        ));
    }

    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if let Err(message) = validate_arguments(&arguments, &options.limits) {
        return RpcResponse::ok(error_response(
            id,
            CODE_INVALID_PARAMS,
            &format!("validation failed: {}", message),
            None,
        ));
    }
    let arguments = match arguments {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        _ => {
            return RpcResponse::ok(error_response(
                id,
                CODE_INVALID_PARAMS,
                "validation failed: arguments must be an object",
                None,
            ));
        }
    };

    let correlation_id = new_correlation_id();
    debug!("tools/call '{}' [{}]", name, correlation_id);
    let mut context = context.clone();
    context.correlation_id = correlation_id.clone();
    match host.call_tool(name, arguments, &context).await {
        CallReply::Outcome(outcome) => {
            if let Some(failure) = outcome.as_failure() {
                warn!(
                    "tools/call '{}' failed [{}]: {} {}",
                    name,
                    correlation_id,
                    failure.kind.code(),
                    failure.message
                );
            }
            let correlation = options
                .include_correlation_id
                .then_some(correlation_id.as_str());
            RpcResponse::ok(outcome_response(id, outcome, correlation))
        }
        CallReply::HttpRateLimited {
            limit,
            window_ms,
            retry_after_secs,
        } => RpcResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: error_response(
                id,
                CODE_RESOURCE_LIMITED,
                "Rate limit exceeded. Please retry later.",
                Some(json!({"code": "RATE_LIMITED", "retryAfterSec": retry_after_secs})),
            ),
            headers: vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-WindowMs", window_ms.to_string()),
                ("Retry-After", retry_after_secs.to_string()),
            ],
        },
    }
}
