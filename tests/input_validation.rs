//! Hostile-input behavior over the full HTTP surface: every crafted input
//! gets a deterministic validation error, and no response ever leaks
//! internals.

mod common;

use axum::http::StatusCode;
use common::{app_for, post_mcp, server_from};
use wiremock::MockServer;

async fn bare_server() -> std::sync::Arc<contextify::server::Server> {
    let backend = MockServer::start().await;
    server_from(serde_json::json!({
        "server": {
            "backendBaseUrl": backend.uri(),
            "policy": {"schemaVersion": 1},
            "endpoints": [
                {"operationId": "GetUser", "httpMethod": "GET", "routeTemplate": "/users/{id}"}
            ]
        },
        "transport": {"maxRequestBodyBytes": 4096, "maxArgumentsJsonDepth": 8}
    }))
    .await
}

fn assert_opaque(message: &str) {
    for marker in ["panic", "backtrace", "src/", ".rs:", "unwrap"] {
        assert!(
            !message.to_lowercase().contains(marker),
            "message leaks internals ({}): {}",
            marker,
            message
        );
    }
}

#[tokio::test]
async fn crafted_names_get_invalid_params() {
    let server = bare_server().await;
    for name in [
        "../../etc/passwd",
        "<script>alert(1)</script>",
        "'; DROP TABLE tools;--",
        "tool\u{0}name",
    ] {
        let body = serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": name, "arguments": {}}
        })
        .to_string();
        let (status, response) = post_mcp(app_for(server.clone()), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["error"]["code"], -32602, "{:?}", name);
        let message = response["error"]["message"].as_str().unwrap();
        assert!(message.contains("validation"), "{}", message);
        assert_opaque(message);
    }
}

#[tokio::test]
async fn over_deep_arguments_get_invalid_params() {
    let server = bare_server().await;
    let mut nested = String::from("1");
    for _ in 0..12 {
        nested = format!("{{\"n\":{}}}", nested);
    }
    let body = format!(
        r#"{{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{{"name":"GetUser","arguments":{}}}}}"#,
        nested
    );
    let (_, response) = post_mcp(app_for(server), body).await;
    assert_eq!(response["error"]["code"], -32602);
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("maximum allowed depth"));
    assert_opaque(message);
}

#[tokio::test]
async fn oversized_body_gets_http_413() {
    let server = bare_server().await;
    let body = format!(
        r#"{{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{{"name":"GetUser","arguments":{{"pad":"{}"}}}}}}"#,
        "x".repeat(8192)
    );
    let (status, response) = post_mcp(app_for(server), body).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    if let Some(message) = response["error"]["message"].as_str() {
        assert!(message.contains("maximum allowed size"));
        assert_opaque(message);
    }
}

#[tokio::test]
async fn malformed_json_gets_parse_error() {
    let server = bare_server().await;
    let (status, response) = post_mcp(app_for(server), "{definitely not json".to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["error"]["message"], "Parse error");
}

#[tokio::test]
async fn unknown_method_gets_method_not_found() {
    let server = bare_server().await;
    let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"}).to_string();
    let (_, response) = post_mcp(app_for(server), body).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn internal_failures_carry_a_correlation_id() {
    // A tool whose backend URL is unroutable forces an upstream failure;
    // the error must carry a correlation id and nothing internal.
    let server = server_from(serde_json::json!({
        "server": {
            "backendBaseUrl": "http://127.0.0.1:9",
            "policy": {"schemaVersion": 1},
            "endpoints": [
                {"operationId": "GetUser", "httpMethod": "GET", "routeTemplate": "/users/{id}"}
            ]
        }
    }))
    .await;

    let body = serde_json::json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/call",
        "params": {"name": "GetUser", "arguments": {"id": 1}}
    })
    .to_string();
    let (_, response) = post_mcp(app_for(server), body).await;
    let error = &response["error"];
    assert!(error["data"]["correlationId"].is_string());
    assert_opaque(error["message"].as_str().unwrap());
}
