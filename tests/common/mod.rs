use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use contextify::config::Config;
use contextify::server::{Server, build_router};
use tower::ServiceExt;

/// Build a running in-process server from a JSON config value, with the
/// catalog already published.
pub async fn server_from(config_json: serde_json::Value) -> Arc<Server> {
    let config: Config = serde_json::from_value(config_json).expect("config should parse");
    let server = Server::from_config(&config).expect("server should start");
    server.provider().reload().await;
    server
}

pub fn app_for(server: Arc<Server>) -> Router {
    build_router(server)
}

/// POST one JSON-RPC body to /mcp and return status plus parsed body.
pub async fn post_mcp(app: Router, body: String) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}
