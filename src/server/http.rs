//! HTTP transport
//!
//! Single-shot JSON-RPC over `POST <http_path>` plus the WebSocket upgrade
//! and a health probe. Non-POST requests on the RPC route get a 405 from the
//! router; malformed JSON bodies get a 400.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use rexd_core::config::Config;
use rexd_core::protocol::Request;

use crate::server::{ws, Service};

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Build the HTTP router with the configured RPC and WS paths.
pub fn router(service: Arc<Service>, cfg: &Config) -> Router {
    Router::new()
        .route(&cfg.server.http_path, post(rpc_handler))
        .route(&cfg.server.ws_path, get(ws::ws_handler))
        .route("/healthz", get(health_check))
        .with_state(service)
}

/// Serve the router until shutdown is signalled.
pub async fn run(service: Arc<Service>, cfg: &Config) -> Result<()> {
    let app = router(service, cfg);
    let listener = tokio::net::TcpListener::bind(&cfg.server.http_listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.http_listen))?;
    info!(
        addr = %cfg.server.http_listen,
        rpc = %cfg.server.http_path,
        ws = %cfg.server.ws_path,
        "http transport listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    Ok(())
}

async fn rpc_handler(State(service): State<Arc<Service>>, body: String) -> HttpResponse {
    let Ok(req) = serde_json::from_str::<Request>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let resp = service.handle(req).await;
    Json(resp).into_response()
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl+c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
