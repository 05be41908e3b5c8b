use super::envelope::Envelope;
use super::registry::ReplyMailbox;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lazy sequence of correlated replies, ending after the first envelope
/// whose `status` is terminal. Not restartable.
///
/// The opening reply is buffered by `Broker::stream` (it was already awaited
/// under the first-reply timeout); later items pop from the mailbox in FIFO
/// order with no per-item bound. The sequence also ends when the connection
/// it was dispatched on is torn down, so a dead agent never leaves a
/// consumer suspended. Dropping the stream early releases the waiter, and
/// any replies still in flight are rerouted as unsolicited.
pub struct ReplyStream {
    buffered: Option<Envelope>,
    mailbox: Option<ReplyMailbox>,
    connection_closed: CancellationToken,
}

impl ReplyStream {
    pub(crate) fn new(
        first: Envelope,
        mailbox: ReplyMailbox,
        connection_closed: CancellationToken,
    ) -> Self {
        Self {
            buffered: Some(first),
            mailbox: Some(mailbox),
            connection_closed,
        }
    }

    /// Next reply, or `None` once a terminal envelope has been yielded or
    /// the connection went away.
    pub async fn next(&mut self) -> Option<Envelope> {
        let envelope = match self.buffered.take() {
            Some(first) => first,
            None => {
                let mailbox = self.mailbox.as_mut()?;
                // Biased so replies delivered before the teardown drain
                // first; the close only wins once the mailbox is empty.
                let received = tokio::select! {
                    biased;
                    received = mailbox.recv() => received,
                    () = self.connection_closed.cancelled() => {
                        warn!(
                            "connection closed mid-stream without a terminal reply (correlation {})",
                            mailbox.correlation_id()
                        );
                        None
                    }
                };
                match received {
                    Some(envelope) => envelope,
                    None => {
                        self.mailbox = None;
                        return None;
                    }
                }
            }
        };

        if envelope.is_terminal() {
            if envelope.is_failed() {
                warn!(
                    "remote {} task reported failure (correlation {})",
                    envelope.kind,
                    envelope.correlation_id.as_deref().unwrap_or("<none>")
                );
            }
            // Deregister now rather than when the consumer drops us.
            self.mailbox = None;
        }

        Some(envelope)
    }

    /// True once the stream has ended, terminally or by disconnect.
    pub fn is_finished(&self) -> bool {
        self.buffered.is_none() && self.mailbox.is_none()
    }
}
