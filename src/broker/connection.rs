use super::envelope::Envelope;
use super::error::BrokerError;
use super::transport::FrameSink;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One live agent connection: the shared write half plus identity metadata.
///
/// Cheap to clone; clones share the underlying sink, and concurrent senders
/// serialize on its lock so frames never interleave.
#[derive(Clone)]
pub struct AgentConnection {
    token: Arc<str>,
    sink: Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>,
    connected_at: DateTime<Utc>,
    closed: CancellationToken,
}

impl AgentConnection {
    pub fn new(token: &str, sink: Box<dyn FrameSink>) -> Self {
        Self {
            token: Arc::from(token),
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            connected_at: Utc::now(),
            closed: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// True when both handles wrap the same transport, as opposed to merely
    /// carrying the same token.
    pub fn same_transport(&self, other: &AgentConnection) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }

    /// Token cancelled when this connection is torn down. Streams of replies
    /// select on it so a dead transport ends them instead of suspending them.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Mark the transport dead, waking everything holding [`Self::closed_token`].
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Write one envelope to the transport.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        let frame = envelope.encode()?;
        let mut sink = self.sink.lock().await;
        sink.send_text(frame)
            .await
            .map_err(|e| BrokerError::Transport {
                message: e.to_string(),
            })
    }
}

/// Live connections keyed by agent token.
#[derive(Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<String, AgentConnection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning the one it replaced. Last connect
    /// wins; the replaced transport closes on its own.
    pub fn register(&self, connection: AgentConnection) -> Option<AgentConnection> {
        self.connections
            .lock()
            .insert(connection.token().to_owned(), connection)
    }

    pub fn lookup(&self, token: &str) -> Option<AgentConnection> {
        self.connections.lock().get(token).cloned()
    }

    /// Remove `connection`'s entry, but only while the table still maps its
    /// token to that same transport. Returns whether anything was removed:
    /// `false` means the entry was already replaced by a newer connection
    /// (or already gone) and must be left alone.
    pub fn remove_connection(&self, connection: &AgentConnection) -> bool {
        let mut connections = self.connections.lock();
        let matches = connections
            .get(connection.token())
            .is_some_and(|live| live.same_transport(connection));
        if matches {
            connections.remove(connection.token());
        }
        matches
    }

    pub fn contains(&self, token: &str) -> bool {
        self.connections.lock().contains_key(token)
    }

    /// Live connect timestamp for `token`, for the agent listing.
    pub fn connected_since(&self, token: &str) -> Option<DateTime<Utc>> {
        self.connections
            .lock()
            .get(token)
            .map(AgentConnection::connected_at)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
