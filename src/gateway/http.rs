//! HTTP 接入层
//!
//! - `GET /ws`：WebSocket 升级
//! - `POST /execute`：需要 Bearer Token，执行脚本，失败时广播 `[Error] ..`
//! - `GET /port-status`：当前端口、状态、TCP 端口与在线客户端数
//! - `GET /health`

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::hub::HubHandle;
use super::port::PortManager;
use super::session::SessionGate;
use super::ws::{ws_handler, WsSettings};
use crate::tools::ScriptRunner;

/// 所有 handler 共享的状态
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub gate: Arc<dyn SessionGate>,
    pub runner: Arc<ScriptRunner>,
    pub ports: Arc<PortManager>,
    pub ws: WsSettings,
    pub tcp_port: u16,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/execute", post(execute))
        .route("/port-status", get(port_status))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub script: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStatusResponse {
    pub port: Option<u16>,
    pub status: String,
    pub tcp_port: u16,
    pub clients: usize,
}

/// 从 Authorization 头取 Token，`Bearer ` 前缀可有可无
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim_start();
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    (!token.is_empty()).then_some(token)
}

async fn authorize(gate: &dyn SessionGate, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(token) = bearer_token(headers) else {
        return Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()));
    };
    if !gate.validate(token).await {
        return Err((StatusCode::UNAUTHORIZED, "Invalid token".to_string()));
    }
    Ok(())
}

/// 先校验 Token 再解析请求体，未授权的请求不会触达 Hub
async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, (StatusCode, String)> {
    authorize(state.gate.as_ref(), &headers).await?;

    let Json(req) = body.map_err(|e| {
        tracing::debug!("rejecting /execute body: {}", e);
        (StatusCode::BAD_REQUEST, "Invalid request body".to_string())
    })?;

    match state.runner.run(&req.script).await {
        Ok(output) => Ok(Json(ExecuteResponse { output, error: None })),
        Err(e) => {
            let message = e.to_string();
            state.hub.broadcast(format!("[Error] {}", message));
            Ok(Json(ExecuteResponse {
                output: String::new(),
                error: Some(message),
            }))
        }
    }
}

async fn port_status(
    State(state): State<AppState>,
) -> Result<Json<PortStatusResponse>, (StatusCode, String)> {
    let clients = state
        .hub
        .client_count()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(PortStatusResponse {
        port: state.ports.current_port(),
        status: state.ports.status().as_str().to_string(),
        tcp_port: state.tcp_port,
        clients,
    }))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::gateway::hub::{Hub, HubConfig};
    use crate::gateway::session::MemorySessionGate;
    use crate::gateway::{Endpoint, Transport};
    use std::time::Duration;

    use crate::tools::LuaEngine;

    async fn test_state() -> AppState {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let gate = MemorySessionGate::default();
        gate.insert("secret", "tester").await;
        let runner = ScriptRunner::new(Arc::new(LuaEngine::new(hub.clone(), Duration::from_secs(5))), 5);
        AppState {
            hub,
            gate: Arc::new(gate),
            runner: Arc::new(runner),
            ports: Arc::new(PortManager::new("127.0.0.1", vec![8080])),
            ws: WsSettings::default(),
            tcp_port: 9000,
        }
    }

    fn execute_request(auth: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/execute")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_bearer_token_prefix_optional() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_execute_requires_token() {
        let app = router(test_state().await);

        let response = app
            .clone()
            .oneshot(execute_request(None, r#"{"script":"1+1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Unauthorized");

        let response = app
            .oneshot(execute_request(Some("Bearer wrong"), r#"{"script":"1+1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Invalid token");
    }

    #[tokio::test]
    async fn test_unauthorized_checked_before_body() {
        let app = router(test_state().await);
        let response = app.oneshot(execute_request(None, "not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_execute_success() {
        let app = router(test_state().await);
        let response = app
            .oneshot(execute_request(Some("Bearer secret"), r#"{"script":"1+1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let parsed: ExecuteResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(parsed.output, "2");
        assert_eq!(parsed.error, None);
    }

    #[tokio::test]
    async fn test_execute_bad_body() {
        let app = router(test_state().await);
        let response = app
            .oneshot(execute_request(Some("secret"), r#"{"code":1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_execute_error_is_broadcast() {
        let state = test_state().await;
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let Endpoint { mut outbound, .. } =
            Endpoint::register(&state.hub, Transport::WebSocket, peer).unwrap();
        let app = router(state);

        let response = app
            .oneshot(execute_request(Some("secret"), r#"{"script":"error('boom')"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let parsed: ExecuteResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(parsed.output, "");
        let error = parsed.error.unwrap();
        assert!(error.starts_with("runtime error: "), "{}", error);
        assert!(error.contains("boom"), "{}", error);

        // 问候行、状态行之后是错误广播
        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.push(outbound.recv().await.unwrap());
        }
        assert_eq!(lines[2], format!("[Error] {}", error));
    }

    #[tokio::test]
    async fn test_port_status_and_health() {
        let app = router(test_state().await);

        let response = app
            .clone()
            .oneshot(Request::get("/port-status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "connecting");
        assert_eq!(json["tcpPort"], 9000);
        assert_eq!(json["clients"], 0);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_is_rejected() {
        let state = test_state().await;
        let hub = state.hub.clone();
        let app = router(state);
        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }
}
