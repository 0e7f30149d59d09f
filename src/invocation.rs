use std::collections::HashMap;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Default header used for API-key auth propagation when none is configured.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Caller credentials carried alongside an invocation. Populated by the
/// transport layer from inbound request headers; never mutated by pipeline
/// actions.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub bearer_token: Option<String>,
    pub api_key: Option<String>,
    /// Header name the API key should be sent under (default `X-API-Key`).
    pub api_key_header: Option<String>,
    /// Session cookies forwarded verbatim under `Cookie`.
    pub cookies: Option<String>,
    pub additional_headers: HashMap<String, String>,
}

impl AuthContext {
    /// Whether any credential field is populated.
    pub fn has_credentials(&self) -> bool {
        self.bearer_token.is_some()
            || self.api_key.is_some()
            || self.cookies.is_some()
            || !self.additional_headers.is_empty()
    }
}

/// Per-call context. Lives for exactly one tool invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    /// Cancellation signal for the whole call. The timeout action attaches
    /// a child deadline; cancelling the parent cancels everything below.
    pub cancel: CancellationToken,
    pub auth: Option<AuthContext>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    /// Opaque short id propagated through logs and internal-error responses.
    pub correlation_id: String,
}

impl Invocation {
    pub fn new(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            cancel: CancellationToken::new(),
            auth: None,
            tenant_id: None,
            user_id: None,
            correlation_id: new_correlation_id(),
        }
    }

    /// Tenant identifier for rate-limit segmentation: the transport-supplied
    /// tenant when present, else an argument literally named `tenantId`.
    pub fn effective_tenant(&self) -> Option<&str> {
        self.tenant_id
            .as_deref()
            .or_else(|| self.arguments.get("tenantId").and_then(Value::as_str))
    }
}

/// Short correlation id: the first segment of a v4 UUID is plenty for log
/// joins and keeps error payloads small.
pub fn new_correlation_id() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    id[..8].to_string()
}

/// Machine-readable failure taxonomy. The wire carries `code()` strings in
/// result payloads and `rpc_code()` in JSON-RPC error objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    InvalidArgument,
    ToolNotFound,
    PolicyDenied,
    RateLimited,
    Timeout,
    Cancelled,
    UpstreamUnavailable,
    UpstreamError,
    ParseError,
    Internal,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            FailureKind::InvalidArgument => "INVALID_ARGUMENT",
            FailureKind::ToolNotFound => "TOOL_NOT_FOUND",
            FailureKind::PolicyDenied => "POLICY_DENIED",
            FailureKind::RateLimited => "RATE_LIMITED",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::Cancelled => "CANCELLED",
            FailureKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            FailureKind::UpstreamError => "UPSTREAM_ERROR",
            FailureKind::ParseError => "PARSE_ERROR",
            FailureKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// JSON-RPC error code this kind maps to.
    pub fn rpc_code(self) -> i64 {
        match self {
            FailureKind::InvalidArgument
            | FailureKind::ToolNotFound
            | FailureKind::PolicyDenied => -32602,
            FailureKind::RateLimited | FailureKind::UpstreamUnavailable => -32001,
            FailureKind::Timeout
            | FailureKind::Cancelled
            | FailureKind::UpstreamError
            | FailureKind::ParseError => -32000,
            FailureKind::Internal => -32603,
        }
    }

    /// Whether failures of this kind are transient by default.
    /// `UpstreamError` depends on the HTTP status and is set per failure.
    pub fn default_transient(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::Timeout | FailureKind::UpstreamUnavailable
        )
    }
}

/// Successful tool content: JSON when the backend produced it, text otherwise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolContent {
    pub text: Option<String>,
    pub json: Option<Value>,
}

/// Structured failure carried back through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
    pub transient: bool,
    pub retry_after_secs: Option<u64>,
}

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(ToolContent),
    Failure(ToolFailure),
}

impl ToolOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        ToolOutcome::Success(ToolContent {
            text: Some(content.into()),
            json: None,
        })
    }

    pub fn json(content: Value) -> Self {
        ToolOutcome::Success(ToolContent {
            text: None,
            json: Some(content),
        })
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ToolOutcome::Failure(ToolFailure {
            kind,
            message: message.into(),
            transient: kind.default_transient(),
            retry_after_secs: None,
        })
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        ToolOutcome::Failure(ToolFailure {
            kind: FailureKind::RateLimited,
            message: message.into(),
            transient: true,
            retry_after_secs,
        })
    }

    pub fn upstream_error(status: u16, message: impl Into<String>) -> Self {
        ToolOutcome::Failure(ToolFailure {
            kind: FailureKind::UpstreamError,
            message: message.into(),
            transient: status >= 500,
            retry_after_secs: None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    pub fn as_failure(&self) -> Option<&ToolFailure> {
        match self {
            ToolOutcome::Failure(f) => Some(f),
            ToolOutcome::Success(_) => None,
        }
    }
}
