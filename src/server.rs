//! Control API.
//!
//! HTTP surface for the PBX event feed and for operators:
//! - `POST /ari/events`: ARI event ingress
//! - `GET  /status`: system status
//! - `GET  /calls`: active call ids
//! - `GET  /calls/{channel_id}`: per-call detail
//! - `POST /calls/{channel_id}/hangup`: force-end a call
//! - `GET  /health`: liveness probe

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::VoiceBridge;
use crate::session::EndReason;

/// Build the control-API router around a running bridge.
pub fn build_router(bridge: Arc<VoiceBridge>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ari/events", post(ari_events_handler))
        .route("/status", get(status_handler))
        .route("/calls", get(calls_handler))
        .route("/calls/{channel_id}", get(call_info_handler))
        .route("/calls/{channel_id}/hangup", post(hangup_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}

/// Bind and serve the control API until the task is cancelled.
pub async fn serve(bridge: Arc<VoiceBridge>, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid control API address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control API on {addr}"))?;
    info!("control API listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(bridge))
        .await
        .context("control API server failed")
}

async fn ari_events_handler(
    State(bridge): State<Arc<VoiceBridge>>,
    Json(event): Json<Value>,
) -> impl IntoResponse {
    let outcome = bridge.handle_ari_event(event).await;
    Json(outcome)
}

async fn status_handler(State(bridge): State<Arc<VoiceBridge>>) -> impl IntoResponse {
    Json(bridge.system_status())
}

async fn calls_handler(State(bridge): State<Arc<VoiceBridge>>) -> impl IntoResponse {
    let calls = bridge.sessions().live_channels();
    Json(json!({
        "active_calls": calls,
        "call_count": calls.len(),
    }))
}

async fn call_info_handler(
    State(bridge): State<Arc<VoiceBridge>>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    match bridge.call_info(&channel_id) {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "call not found"})),
        )
            .into_response(),
    }
}

async fn hangup_handler(
    State(bridge): State<Arc<VoiceBridge>>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    bridge.end_call(&channel_id, EndReason::Hangup).await;
    Json(json!({"status": "call_ended", "channel_id": channel_id}))
}

async fn health_handler(State(bridge): State<Arc<VoiceBridge>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "ari-voice-bridge",
        "is_running": bridge.is_running(),
    }))
}
