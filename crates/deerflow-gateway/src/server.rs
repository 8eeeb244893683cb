//! Axum-based HTTP server.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::{Method, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use deerflow_core::config::Config;

use crate::chat::{chat_completions, thread_chat};
use crate::state::GatewayState;

/// All routes with CORS and request tracing applied.
pub fn router(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_TYPE, header::CACHE_CONTROL])
        .max_age(Duration::from_secs(12 * 60 * 60));

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/chat/stream", post(thread_chat))
        .route("/api/config", get(config_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the gateway and serve until Ctrl-C or `state.shutdown` fires.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let (bind_addr, _) = state.config.listen_addr();
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn config_handler() -> impl IntoResponse {
    axum::Json(json!({
        "rag": { "provider": "" },
        "models": {
            "basic": Config::basic_model_names(),
            "reasoning": [],
        },
    }))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tools": state.factory.registry().research_tools().len(),
    }))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(%e, "Failed to install Ctrl-C handler");
                shutdown.cancelled().await;
            }
        }
        _ = shutdown.cancelled() => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
