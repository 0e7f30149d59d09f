use super::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_json(backend: &str, policy: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "core": {"applicationName": "ctx-local", "enableDebugEndpoints": true},
        "server": {
            "backendBaseUrl": backend,
            "policy": policy,
            "endpoints": [
                {"operationId": "GetUser", "httpMethod": "GET", "routeTemplate": "/users/{id}"},
                {"operationId": "DeleteUser", "httpMethod": "DELETE", "routeTemplate": "/users/{id}"}
            ]
        }
    })
}

async fn server_with(config_json: serde_json::Value) -> Arc<Server> {
    let config: Config = serde_json::from_value(config_json).unwrap();
    let server = Server::from_config(&config).unwrap();
    server.provider().reload().await;
    server
}

async fn post_mcp(server: Arc<Server>, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let app = build_router(server);
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn deny_by_default_lists_only_allowed_tools() {
    let backend = MockServer::start().await;
    let server = server_with(config_json(
        &backend.uri(),
        serde_json::json!({
            "schemaVersion": 1,
            "denyByDefault": true,
            "allow": [{"operationId": "GetUser", "method": "GET", "timeoutMs": 5000}]
        }),
    ))
    .await;

    let (_, body) = post_mcp(
        server,
        serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "GetUser");
}

#[tokio::test]
async fn allowed_call_reaches_the_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/7"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 7, "name": "Ada"})),
        )
        .mount(&backend)
        .await;

    let server = server_with(config_json(
        &backend.uri(),
        serde_json::json!({
            "schemaVersion": 1,
            "denyByDefault": true,
            "allow": [{"operationId": "GetUser", "method": "GET", "timeoutMs": 5000}]
        }),
    ))
    .await;

    let (status, body) = post_mcp(
        server,
        serde_json::json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "GetUser", "arguments": {"id": 7}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    let payload: serde_json::Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["name"], "Ada");
}

#[tokio::test]
async fn denied_tool_is_invisible_and_uncallable() {
    let backend = MockServer::start().await;
    let server = server_with(config_json(
        &backend.uri(),
        serde_json::json!({
            "schemaVersion": 1,
            "denyByDefault": false,
            "deny": [{"operationId": "DeleteUser"}]
        }),
    ))
    .await;

    let (_, list) = post_mcp(
        server.clone(),
        serde_json::json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}),
    )
    .await;
    let names: Vec<&str> = list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["GetUser"]);

    let (_, call) = post_mcp(
        server,
        serde_json::json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": {"name": "DeleteUser", "arguments": {"id": 1}}
        }),
    )
    .await;
    assert_eq!(call["error"]["data"]["code"], "TOOL_NOT_FOUND");
}

#[tokio::test]
async fn slow_backend_times_out_transiently() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"id": 1}))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&backend)
        .await;

    let server = server_with(config_json(
        &backend.uri(),
        serde_json::json!({
            "schemaVersion": 1,
            "denyByDefault": true,
            "allow": [{"operationId": "GetUser", "method": "GET", "timeoutMs": 200}]
        }),
    ))
    .await;

    let (status, body) = post_mcp(
        server,
        serde_json::json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": {"name": "GetUser", "arguments": {"id": 1}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["data"]["code"], "TIMEOUT");
    assert_eq!(body["error"]["data"]["transient"], true);
}

#[tokio::test]
async fn per_tool_rate_limit_denies_the_third_call() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 1})))
        .mount(&backend)
        .await;

    let server = server_with(config_json(
        &backend.uri(),
        serde_json::json!({
            "schemaVersion": 1,
            "denyByDefault": true,
            "allow": [{
                "operationId": "GetUser",
                "method": "GET",
                "rateLimit": {"strategy": "fixedWindow", "permitLimit": 2, "windowMs": 10000}
            }]
        }),
    ))
    .await;

    let call = serde_json::json!({
        "jsonrpc": "2.0", "id": 6, "method": "tools/call",
        "params": {"name": "GetUser", "arguments": {"id": 1}}
    });
    let (_, first) = post_mcp(server.clone(), call.clone()).await;
    assert!(first["result"].is_object(), "first call should pass: {}", first);
    let (_, second) = post_mcp(server.clone(), call.clone()).await;
    assert!(second["result"].is_object());

    let (_, third) = post_mcp(server, call).await;
    assert_eq!(third["error"]["data"]["code"], "RATE_LIMITED");
    assert_eq!(third["error"]["data"]["transient"], true);
}

#[tokio::test(start_paused = true)]
async fn config_updates_refresh_endpoints_and_inline_policy() {
    // No backend traffic in this test; the executor is never reached.
    let initial: Config = serde_json::from_value(serde_json::json!({
        "server": {
            "backendBaseUrl": "http://127.0.0.1:1",
            "policy": {
                "schemaVersion": 1,
                "denyByDefault": true,
                "allow": [{"operationId": "GetUser"}]
            },
            "endpoints": [
                {"operationId": "GetUser", "httpMethod": "GET", "routeTemplate": "/users/{id}"}
            ]
        }
    }))
    .unwrap();
    let server = Server::from_config(&initial).unwrap();
    server.provider().reload().await;

    let (_, before) = post_mcp(
        server.clone(),
        serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    assert_eq!(before["result"]["tools"].as_array().unwrap().len(), 1);

    let updated: Config = serde_json::from_value(serde_json::json!({
        "server": {
            "backendBaseUrl": "http://127.0.0.1:1",
            "policy": {
                "schemaVersion": 1,
                "denyByDefault": true,
                "allow": [{"operationId": "GetUser"}, {"operationId": "ListUsers"}]
            },
            "endpoints": [
                {"operationId": "GetUser", "httpMethod": "GET", "routeTemplate": "/users/{id}"},
                {"operationId": "ListUsers", "httpMethod": "GET", "routeTemplate": "/users"}
            ]
        }
    }))
    .unwrap();

    // Get past the rebuild throttle, then apply the update.
    tokio::time::advance(crate::catalog::provider::MIN_RELOAD_INTERVAL).await;
    server.apply_config(&updated).await;

    let (_, after) = post_mcp(
        server,
        serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    let names: Vec<&str> = after["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["GetUser", "ListUsers"]);
}

#[tokio::test]
async fn config_level_denied_tools_gate_the_document_policy() {
    let backend = MockServer::start().await;
    let mut config = config_json(
        &backend.uri(),
        serde_json::json!({"schemaVersion": 1}),
    );
    config["policy"] = serde_json::json!({"deniedTools": ["DeleteUser"]});
    let server = server_with(config).await;

    let (_, list) = post_mcp(
        server.clone(),
        serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}),
    )
    .await;
    let names: Vec<&str> = list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["GetUser"]);

    let (_, call) = post_mcp(
        server,
        serde_json::json!({
            "jsonrpc": "2.0", "id": 8, "method": "tools/call",
            "params": {"name": "DeleteUser", "arguments": {"id": 1}}
        }),
    )
    .await;
    assert_eq!(call["error"]["data"]["code"], "POLICY_DENIED");
}

#[tokio::test]
async fn debug_endpoint_lists_the_catalog_when_enabled() {
    let backend = MockServer::start().await;
    let server = server_with(config_json(
        &backend.uri(),
        serde_json::json!({"schemaVersion": 1}),
    ))
    .await;

    let app = build_router(server);
    let request = Request::builder()
        .method("GET")
        .uri("/contextify/tools")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 65536).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["tools"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn manifest_is_served() {
    let backend = MockServer::start().await;
    let server = server_with(config_json(
        &backend.uri(),
        serde_json::json!({"schemaVersion": 1}),
    ))
    .await;

    let app = build_router(server);
    let request = Request::builder()
        .method("GET")
        .uri(MANIFEST_PATH)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(manifest["name"], "ctx-local");
}
