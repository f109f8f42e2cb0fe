//! HTTP control surface
//!
//! `GET /health`, `GET /ready`, `GET /metrics`, `POST /reload` and
//! `POST /rpc` for orchestration and programmatic callers.

use crate::engine::{Engine, ReloadError};
use crate::rpc::RpcHandler;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use policy::ReloadOutcome;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
struct ControlState {
    engine: Arc<Engine>,
    rpc: RpcHandler,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = ControlState {
        rpc: RpcHandler::operator(engine.clone()),
        engine,
    };
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/reload", post(reload))
        .route("/rpc", post(rpc))
        .with_state(state)
}

/// Serve the control surface until `shutdown` fires
pub async fn serve(engine: Arc<Engine>, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "control surface listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn ready(State(state): State<ControlState>) -> Response {
    let reasons = state.engine.not_ready();
    if reasons.is_empty() {
        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reasons": reasons})),
        )
            .into_response()
    }
}

async fn metrics(State(state): State<ControlState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.render_metrics(),
    )
        .into_response()
}

async fn reload(State(state): State<ControlState>) -> Response {
    match state.engine.reload_policy().await {
        Ok(ReloadOutcome::Updated { from, to }) => {
            info!(from, to, "policy reloaded via control surface");
            Json(json!({"outcome": "updated", "from": from, "version": to})).into_response()
        }
        Ok(ReloadOutcome::Unchanged { version }) => {
            Json(json!({"outcome": "unchanged", "version": version})).into_response()
        }
        Err(ReloadError::Parse(e)) => {
            warn!(error = %e, "policy reload rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string(), "version": state.engine.rules().version})),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "policy reload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn rpc(State(state): State<ControlState>, body: String) -> Response {
    match state.rpc.handle_message(&body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::engine_with_policy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(policy: &str) -> (Arc<Engine>, std::net::SocketAddr, CancellationToken, tempfile::TempDir) {
        let (engine, dir) = engine_with_policy(policy);
        let engine = Arc::new(engine);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(engine.clone(), listener, shutdown.clone()));
        (engine, addr, shutdown, dir)
    }

    async fn request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let message = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        stream.write_all(message.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_health_ready_metrics() {
        let (_engine, addr, shutdown, _dir) = start("version: 1\n").await;

        let response = request(addr, "GET", "/health", "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#"{"status":"ok"}"#));

        let response = request(addr, "GET", "/ready", "").await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let response = request(addr, "GET", "/metrics", "").await;
        assert!(response.contains("warden_policy_version 1"));
        assert!(response.contains("warden_audit_degraded 0"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reload_rejects_bad_policy() {
        let (engine, addr, shutdown, _dir) = start("version: 1\n").await;
        let policy = engine.policy_path().to_path_buf();

        std::fs::write(&policy, "version: 1\ndefaults:\n  command: maybe\n").unwrap();
        let response = request(addr, "POST", "/reload", "").await;
        assert!(response.starts_with("HTTP/1.1 400"));
        assert_eq!(engine.rules().version, 1);

        std::fs::write(&policy, "version: 1\ndefaults:\n  command: allow\n").unwrap();
        let response = request(addr, "POST", "/reload", "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""version":2"#));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_rpc_over_http() {
        let (_engine, addr, shutdown, _dir) = start("version: 1\n").await;
        let response = request(
            addr,
            "POST",
            "/rpc",
            r#"{"jsonrpc":"2.0","id":7,"method":"policy.version"}"#,
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""id":7"#));
        assert!(response.contains(r#""version":1"#));
        shutdown.cancel();
    }
}
