//! Agent WebSocket endpoint.
//!
//! `GET /ws/agent` authenticates with an issued agent token, supplied either
//! as `Authorization: Bearer <token>` or as `?token=<token>`, then upgrades
//! and hands both socket halves to the broker. The HTTP handler is the only
//! place that sees axum's WebSocket types; the broker works against its own
//! transport traits.

use super::AppState;
use crate::broker::{FrameSink, FrameStream};
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

/// GET /ws/agent — upgrade an agent's persistent connection.
pub async fn handle_ws_agent(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = bearer_token(&headers)
        .map(str::to_owned)
        .or(query.token)
        .unwrap_or_default();
    if token.is_empty() {
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized — supply a bearer token or ?token=<agent_token>",
        )
            .into_response();
    }

    match state.store.token_exists(&token).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("rejecting WebSocket from unknown agent token");
            return (StatusCode::UNAUTHORIZED, "Unknown agent token").into_response();
        }
        Err(e) => {
            tracing::error!("token lookup failed during WebSocket accept: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let (sender, receiver) = socket.split();
    let reader = state
        .broker
        .connect(&token, Box::new(WsSink(sender)), Box::new(WsStream(receiver)))
        .await;
    // Keep the upgraded task alive until the broker tears the connection
    // down; the reader owns all receive-side work.
    let _ = reader.await;
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, frame: String) -> Result<()> {
        self.0
            .send(Message::Text(frame.into()))
            .await
            .map_err(Into::into)
    }
}

struct WsStream(SplitStream<WebSocket>);

#[async_trait]
impl FrameStream for WsStream {
    async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            return match self.0.next().await {
                Some(Ok(Message::Text(text))) => Ok(Some(text.to_string())),
                Some(Ok(Message::Close(_))) | None => Ok(None),
                // Binary frames have no meaning on this endpoint.
                Some(Ok(Message::Binary(frame))) => {
                    debug!("skipping {}-byte binary frame", frame.len());
                    continue;
                }
                // Ping/Pong are handled by the protocol layer.
                Some(Ok(_)) => continue,
                Some(Err(e)) => Err(e.into()),
            };
        }
    }
}
