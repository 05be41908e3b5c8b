//! Reference agent for local development and end-to-end tests.
//!
//! Connects out to a gateway with an issued token, announces a small object
//! inventory via the sync handshake, then answers dispatched tasks until
//! the gateway closes the connection:
//!
//! - `GENERATE` streams a handful of partial replies before the terminal one
//! - every other kind is acknowledged with a completed echo of its payload

use crate::broker::{Envelope, STATUS_COMPLETED};
use crate::sync::{SYNC_REPLY, SYNC_REQUEST};
use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::RngExt;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use uuid::Uuid;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connect to `url` (a `ws://host:port/ws/agent` endpoint) as the agent
/// holding `token` and serve tasks until disconnected.
pub async fn run(url: &str, token: &str) -> Result<()> {
    let url = if url.contains('?') {
        format!("{url}&token={token}")
    } else {
        format!("{url}?token={token}")
    };

    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .context("WebSocket connect failed")?;
    let (mut write, mut read) = ws_stream.split();
    info!("connected to gateway");

    // Announce the inventory before accepting work.
    let sync = Envelope::correlated(
        SYNC_REQUEST,
        Uuid::new_v4().to_string(),
        sample_inventory(),
    );
    write.send(Message::Text(sync.encode()?.into())).await?;

    while let Some(message) = read.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(e).context("gateway connection failed"),
        };

        let envelope = match Envelope::decode(text.as_ref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("ignoring malformed frame from gateway: {e}");
                continue;
            }
        };

        match envelope.kind.as_str() {
            SYNC_REPLY => {
                info!("gateway persisted the object sync");
            }
            "GENERATE" => run_generate(&mut write, &envelope).await?,
            _ => {
                let reply = echo_reply(&envelope);
                write.send(Message::Text(reply.encode()?.into())).await?;
                info!("completed `{}` task", envelope.kind);
            }
        }
    }

    info!("gateway closed the connection");
    Ok(())
}

/// The objects this agent pretends to serve.
fn sample_inventory() -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("models".into(), json!(["gpt-sim-small", "gpt-sim-large"]));
    payload.insert("prompts".into(), json!(["greeting", "summarize"]));
    payload
}

/// Streamed task: `chunks` partial replies, then the terminal one, with a
/// little latency jitter so consumers see realistic interleaving.
async fn run_generate(write: &mut WsWriter, request: &Envelope) -> Result<()> {
    let chunks = request
        .payload
        .get("chunks")
        .and_then(Value::as_u64)
        .unwrap_or(4);

    for seq in 0..chunks {
        // ThreadRng is not Send, so draw the jitter before awaiting.
        let delay_ms: u64 = rand::rng().random_range(30..140);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let mut payload = Map::new();
        payload.insert("status".into(), json!("streaming"));
        payload.insert("seq".into(), json!(seq));
        payload.insert("text".into(), json!(format!("chunk {seq}")));
        let chunk = reply_to(request, payload);
        write.send(Message::Text(chunk.encode()?.into())).await?;
    }

    let mut payload = Map::new();
    payload.insert("status".into(), json!(STATUS_COMPLETED));
    payload.insert("seq".into(), json!(chunks));
    let done = reply_to(request, payload);
    write.send(Message::Text(done.encode()?.into())).await?;

    info!("streamed {chunks} chunks");
    Ok(())
}

/// Completed ack carrying the request payload back under `echo`.
fn echo_reply(request: &Envelope) -> Envelope {
    let mut payload = Map::new();
    payload.insert("status".into(), json!(STATUS_COMPLETED));
    payload.insert("echo".into(), Value::Object(request.payload.clone()));
    reply_to(request, payload)
}

/// Reply envelope of the same kind, echoing the correlation id verbatim.
fn reply_to(request: &Envelope, payload: Map<String, Value>) -> Envelope {
    match &request.correlation_id {
        Some(correlation_id) => {
            Envelope::correlated(&request.kind, correlation_id.clone(), payload)
        }
        None => Envelope::new(&request.kind, payload),
    }
}
