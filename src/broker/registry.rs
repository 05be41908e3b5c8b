use super::envelope::Envelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

type WaiterMap = HashMap<String, mpsc::UnboundedSender<Envelope>>;

/// Maps a correlation id to the mailbox of the call waiting on it.
///
/// One entry per in-flight `request`/`stream`. Pushing into the channel is
/// both the FIFO buffer append and the waiter wakeup, so there is no
/// separate notification step to get wrong.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    waiters: Arc<Mutex<WaiterMap>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`.
    ///
    /// The returned mailbox removes its entry when dropped, so abandoning a
    /// call cleans up on every exit path without explicit bookkeeping.
    pub fn register(&self, correlation_id: &str) -> ReplyMailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().insert(correlation_id.to_owned(), tx);
        ReplyMailbox {
            correlation_id: correlation_id.to_owned(),
            receiver: rx,
            waiters: Arc::downgrade(&self.waiters),
        }
    }

    /// Deliver `envelope` to the waiter registered for `correlation_id`.
    ///
    /// Gives the envelope back when no waiter is registered (the call timed
    /// out or was abandoned) so the caller can route it as unsolicited.
    pub fn deliver(&self, correlation_id: &str, envelope: Envelope) -> Result<(), Envelope> {
        let waiters = self.waiters.lock();
        match waiters.get(correlation_id) {
            // The send fails only when the mailbox was dropped but its Drop
            // has not taken the lock yet; same outcome as no entry.
            Some(tx) => tx.send(envelope).map_err(|rejected| rejected.0),
            None => Err(envelope),
        }
    }

    /// Number of in-flight waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiver half of one pending waiter. Dropping it deregisters the
/// correlation id.
pub struct ReplyMailbox {
    correlation_id: String,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    waiters: Weak<Mutex<WaiterMap>>,
}

impl ReplyMailbox {
    /// Await the next delivered envelope. `None` means the registry itself
    /// was torn down while this call was pending.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for ReplyMailbox {
    fn drop(&mut self) {
        if let Some(waiters) = self.waiters.upgrade() {
            waiters.lock().remove(&self.correlation_id);
        }
    }
}
