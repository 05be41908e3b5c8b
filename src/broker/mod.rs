//! Bidirectional connection broker.
//!
//! Each registered agent holds one persistent WebSocket to the server, and
//! the broker multiplexes three dispatch modes over it:
//!
//! - [`Broker::send`]: fire-and-forget, no reply expected
//! - [`Broker::request`]: exactly one correlated reply, bounded by a timeout
//! - [`Broker::stream`]: FIFO replies until a terminal `status`, with the
//!   first reply bounded by its own timeout
//!
//! Replies carry the caller-generated correlation id; the per-connection
//! reader loop routes them back through the [`CorrelationRegistry`].
//! Inbound envelopes with no pending waiter are agent-initiated work and go
//! to the [`UnsolicitedHandler`].

pub mod connection;
pub mod envelope;
pub mod error;
mod reader;
pub mod registry;
pub mod stream;
pub mod transport;

pub use connection::{AgentConnection, ConnectionTable};
pub use envelope::{Envelope, STATUS_COMPLETED, STATUS_FAILED};
pub use error::BrokerError;
pub use registry::{CorrelationRegistry, ReplyMailbox};
pub use stream::ReplyStream;
pub use transport::{FrameSink, FrameStream};

use crate::store::ProjectStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

/// Server-side hook for agent-initiated envelopes: anything inbound that is
/// not a reply to a pending request (no correlation id, or the waiter is
/// already gone).
#[async_trait]
pub trait UnsolicitedHandler: Send + Sync {
    /// Process one unsolicited envelope. Replies, if any, go back over the
    /// same connection. Errors are logged by the reader loop and never tear
    /// the connection down.
    async fn handle(
        &self,
        token: &str,
        envelope: Envelope,
        connection: &AgentConnection,
    ) -> Result<()>;
}

/// The connection broker. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Broker {
    connections: Arc<ConnectionTable>,
    registry: CorrelationRegistry,
    store: Arc<dyn ProjectStore>,
    handler: Arc<dyn UnsolicitedHandler>,
    shutdown: CancellationToken,
    readers: TaskTracker,
}

impl Broker {
    pub fn new(store: Arc<dyn ProjectStore>, handler: Arc<dyn UnsolicitedHandler>) -> Self {
        Self {
            connections: Arc::new(ConnectionTable::new()),
            registry: CorrelationRegistry::new(),
            store,
            handler,
            shutdown: CancellationToken::new(),
            readers: TaskTracker::new(),
        }
    }

    /// Accept a freshly upgraded transport for `token` and spawn its reader
    /// loop. The returned handle resolves when the connection is torn down.
    ///
    /// A second connection for the same token replaces the first; the
    /// replaced transport closes on its own and its teardown leaves the new
    /// entry alone.
    pub async fn connect(
        &self,
        token: &str,
        sink: Box<dyn FrameSink>,
        frames: Box<dyn FrameStream>,
    ) -> JoinHandle<()> {
        let connection = AgentConnection::new(token, sink);
        if self.connections.register(connection.clone()).is_some() {
            info!("replacing existing connection for agent {token}");
        }

        // Presence is best-effort: the connection stays usable even when
        // the store write fails.
        if let Err(e) = self.store.set_online(token).await {
            warn!("failed to mark agent {token} online: {e:#}");
        }
        info!("agent {token} connected");

        self.readers
            .spawn(reader::run(self.clone(), frames, connection))
    }

    /// Tear down one connection. Called from exactly one place, the exit of
    /// its reader loop, so it runs once per connection however the loop
    /// ended.
    pub(crate) async fn disconnect(&self, connection: &AgentConnection) {
        let token = connection.token();

        // End any reply stream still bound to this transport. Replaced or
        // not, nothing further can arrive on it.
        connection.mark_closed();

        if !self.connections.remove_connection(connection) {
            // Replaced by a newer connection, which now owns presence.
            info!("skipping disconnect bookkeeping for superseded agent {token} connection");
            return;
        }

        if let Err(e) = self.store.disconnect_and_cascade(token).await {
            warn!("failed to mark agent {token} offline: {e:#}");
        }
        info!("agent {token} disconnected");
    }

    /// Fire-and-forget dispatch: one uncorrelated frame, no reply expected.
    pub async fn send(
        &self,
        token: &str,
        kind: &str,
        payload: Map<String, Value>,
    ) -> Result<(), BrokerError> {
        let connection = self.lookup(token)?;
        connection.send(&Envelope::new(kind, payload)).await
    }

    /// Dispatch and await exactly one correlated reply.
    ///
    /// A reply payload carrying `"status": "failed"` is returned as data;
    /// only broker-level failures become errors. On timeout the pending
    /// waiter is removed, and a reply that races past the deadline reroutes
    /// to the unsolicited handler.
    pub async fn request(
        &self,
        token: &str,
        kind: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Envelope, BrokerError> {
        let connection = self.lookup(token)?;
        let correlation_id = Uuid::new_v4().to_string();
        let mut mailbox = self.registry.register(&correlation_id);

        connection
            .send(&Envelope::correlated(kind, &correlation_id, payload))
            .await?;

        // The mailbox drops on every path out of here, removing the waiter.
        match tokio::time::timeout(timeout, mailbox.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BrokerError::Transport {
                message: "reply channel closed before a reply arrived".into(),
            }),
            Err(_) => {
                warn!("`{kind}` request to agent {token} timed out after {timeout:?}");
                Err(BrokerError::Timeout {
                    kind: kind.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Dispatch and stream correlated replies until a terminal status.
    ///
    /// Connection and timeout failures surface here, before any item is
    /// yielded: the first reply is awaited under `first_timeout`. Later
    /// items have no per-item bound; the sequence simply ends if the agent
    /// disappears without a terminal reply.
    pub async fn stream(
        &self,
        token: &str,
        kind: &str,
        payload: Map<String, Value>,
        first_timeout: Duration,
    ) -> Result<ReplyStream, BrokerError> {
        let connection = self.lookup(token)?;
        let correlation_id = Uuid::new_v4().to_string();
        let mut mailbox = self.registry.register(&correlation_id);

        connection
            .send(&Envelope::correlated(kind, &correlation_id, payload))
            .await?;

        let first = match tokio::time::timeout(first_timeout, mailbox.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                return Err(BrokerError::Transport {
                    message: "reply channel closed before the first reply".into(),
                })
            }
            Err(_) => {
                warn!("`{kind}` stream to agent {token} saw no reply within {first_timeout:?}");
                return Err(BrokerError::Timeout {
                    kind: kind.to_owned(),
                    timeout: first_timeout,
                });
            }
        };

        Ok(ReplyStream::new(first, mailbox, connection.closed_token()))
    }

    fn lookup(&self, token: &str) -> Result<AgentConnection, BrokerError> {
        self.connections
            .lookup(token)
            .ok_or_else(|| BrokerError::NoActiveConnection {
                token: token.to_owned(),
            })
    }

    /// True when `token` has a live connection right now.
    pub fn is_connected(&self, token: &str) -> bool {
        self.connections.contains(token)
    }

    /// Connect timestamp of `token`'s live connection, if any.
    pub fn connected_since(&self, token: &str) -> Option<DateTime<Utc>> {
        self.connections.connected_since(token)
    }

    /// Number of live connections.
    pub fn agent_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of in-flight reply waiters.
    pub fn pending_replies(&self) -> usize {
        self.registry.len()
    }

    /// Cancellation token observed by the reader loops and the HTTP server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every reader loop and wait for their disconnect bookkeeping
    /// to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.readers.close();
        self.readers.wait().await;
    }
}
