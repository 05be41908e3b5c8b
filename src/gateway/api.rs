//! Dispatch handlers: HTTP bodies in, broker calls out.

use super::AppState;
use crate::broker::BrokerError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::time::Duration;

/// Upper bound for a caller-supplied dispatch timeout, in milliseconds.
pub(crate) const MAX_TIMEOUT_MS: u64 = 60_000;

/// Body accepted by every dispatch route.
#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    /// Task-kind discriminator, forwarded as the envelope's `type`.
    #[serde(rename = "type")]
    kind: String,
    /// Opaque payload fields flattened into the outbound envelope.
    #[serde(default)]
    payload: Map<String, Value>,
    /// Per-call reply bound; clamped to [`MAX_TIMEOUT_MS`]. Ignored by
    /// `/send`, which never waits.
    timeout_ms: Option<u64>,
}

fn dispatch_timeout(requested_ms: Option<u64>, default_secs: u64) -> Duration {
    let default_ms = default_secs.saturating_mul(1_000).min(MAX_TIMEOUT_MS);
    Duration::from_millis(requested_ms.map_or(default_ms, |ms| ms.min(MAX_TIMEOUT_MS)))
}

/// Map a broker failure onto the HTTP surface: 503 for no connection, 504
/// for a reply timeout, 502 for transport trouble, 500 for the rest.
fn error_response(err: &BrokerError) -> (StatusCode, Json<Value>) {
    let status = match err {
        BrokerError::NoActiveConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BrokerError::Transport { .. } => StatusCode::BAD_GATEWAY,
        BrokerError::Decode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

/// POST /api/agents/{token}/send — fire-and-forget dispatch.
pub async fn handle_send(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<DispatchBody>,
) -> Response {
    match state.broker.send(&token, &body.kind, body.payload).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// POST /api/agents/{token}/request — dispatch and await one reply.
pub async fn handle_request(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<DispatchBody>,
) -> Response {
    let timeout = dispatch_timeout(body.timeout_ms, state.timeouts.request_timeout_secs);
    match state
        .broker
        .request(&token, &body.kind, body.payload, timeout)
        .await
    {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// POST /api/agents/{token}/stream — dispatch and relay replies as SSE,
/// one `data:` event per envelope, ending after the terminal one.
///
/// Connection and first-reply-timeout failures surface as plain JSON errors
/// before any event is written; once the response is committed, trouble can
/// only end the stream early.
pub async fn handle_stream(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<DispatchBody>,
) -> Response {
    let timeout = dispatch_timeout(
        body.timeout_ms,
        state.timeouts.stream_first_reply_timeout_secs,
    );
    let replies = match state
        .broker
        .stream(&token, &body.kind, body.payload, timeout)
        .await
    {
        Ok(replies) => replies,
        Err(e) => return error_response(&e).into_response(),
    };

    let events = stream::unfold(replies, |mut replies| async move {
        let envelope = replies.next().await?;
        let event = match Event::default().json_data(&envelope) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("failed to encode SSE event: {e}");
                Event::default().comment("encode error")
            }
        };
        Some((Ok::<_, Infallible>(event), replies))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
