//! HTTP/WebSocket gateway: the server's outer surface.
//!
//! Callers dispatch work over plain HTTP (`/api/agents/{token}/...`); agents
//! hold one persistent WebSocket each (`/ws/agent`). The gateway stays a
//! thin shell: auth at the accept boundary, body/timeout limits, and JSON
//! mapping of [`BrokerError`](crate::broker::BrokerError) values. Everything
//! stateful lives in the broker and the store.

pub mod api;
pub mod ws;

use crate::broker::Broker;
use crate::config::{BrokerConfig, Config};
use crate::store::ProjectStore;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum dispatch body size (64KB). Envelopes are control-plane messages,
/// not file transfers.
pub const MAX_BODY_SIZE: usize = 65_536;

/// Outer HTTP timeout. Must stay above the largest dispatch bound
/// ([`api::MAX_TIMEOUT_MS`]) so a slow agent surfaces as 504 from the error
/// mapping rather than a blanket 408.
pub const REQUEST_TIMEOUT_SECS: u64 = 75;

/// Shared state for all gateway handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub store: Arc<dyn ProjectStore>,
    pub timeouts: BrokerConfig,
}

/// Returns true when `host` is not a loopback address.
pub fn is_public_bind(host: &str) -> bool {
    !matches!(
        host,
        "127.0.0.1" | "localhost" | "::1" | "[::1]" | "0:0:0:0:0:0:0:1"
    )
}

/// Build the gateway router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/agents", get(handle_list_agents))
        .route("/api/agents/{token}/send", post(api::handle_send))
        .route("/api/agents/{token}/request", post(api::handle_request))
        .route("/api/agents/{token}/stream", post(api::handle_stream))
        .route("/ws/agent", get(ws::handle_ws_agent))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Bind the listener and serve until the broker's shutdown token fires.
pub async fn run_gateway(
    config: &Config,
    broker: Broker,
    store: Arc<dyn ProjectStore>,
) -> Result<()> {
    let host = config.gateway.host.as_str();
    let port = config.gateway.port;

    // ── Security: refuse public bind without explicit opt-in ──
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "🛑 Refusing to bind to {host} — the agent control plane would be exposed to the internet.\n\
             Fix: use --host 127.0.0.1 (default), front the server with a trusted proxy, or set\n\
             [gateway] allow_public_bind = true in config.toml (NOT recommended)."
        );
    }

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address: {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();
    let display_addr = format!("{host}:{actual_port}");

    let shutdown = broker.shutdown_token();
    let state = AppState {
        broker,
        store,
        timeouts: config.broker.clone(),
    };

    println!("🔌 AgentWire gateway listening on http://{display_addr}");
    println!("  GET  /health                      — health check");
    println!("  GET  /api/agents                  — issued tokens and live presence");
    println!("  POST /api/agents/{{token}}/send     — fire-and-forget dispatch");
    println!("  POST /api/agents/{{token}}/request  — dispatch, await one reply");
    println!("  POST /api/agents/{{token}}/stream   — dispatch, stream replies (SSE)");
    println!("  GET  /ws/agent                    — agent WebSocket (?token=<agent_token>)");
    println!("  Press Ctrl+C to stop.\n");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// GET /health — always public (no secrets leaked).
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "agents_connected": state.broker.agent_count(),
        "pending_replies": state.broker.pending_replies(),
    }))
}

/// GET /api/agents — every issued token with its live presence.
async fn handle_list_agents(State(state): State<AppState>) -> Response {
    let agents = match state.store.list_agents().await {
        Ok(agents) => agents,
        Err(e) => {
            tracing::error!("failed to list agents: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to list agents"})),
            )
                .into_response();
        }
    };

    let rows: Vec<serde_json::Value> = agents
        .iter()
        .map(|agent| {
            serde_json::json!({
                "token": agent.token,
                "project": agent.project,
                "online": state.broker.is_connected(&agent.token),
                "connected_since": state.broker.connected_since(&agent.token),
            })
        })
        .collect();

    Json(serde_json::json!({ "agents": rows })).into_response()
}
