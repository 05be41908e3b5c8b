use super::connection::AgentConnection;
use super::envelope::Envelope;
use super::transport::FrameStream;
use super::Broker;
use tracing::{debug, info, warn};

/// Per-connection inbound loop: decode frames, route correlated replies to
/// their waiters, hand everything else to the unsolicited-task handler.
///
/// Exits on clean close, transport error, malformed frame, or broker
/// shutdown, then runs this connection's one and only disconnect.
pub(crate) async fn run(
    broker: Broker,
    mut frames: Box<dyn FrameStream>,
    connection: AgentConnection,
) {
    let token = connection.token().to_owned();

    loop {
        let received = tokio::select! {
            () = broker.shutdown.cancelled() => {
                info!("closing agent {token} connection for shutdown");
                break;
            }
            received = frames.recv_text() => received,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("agent {token} closed the connection");
                break;
            }
            Err(e) => {
                warn!("transport error on agent {token} connection: {e}");
                break;
            }
        };

        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping agent {token} connection after malformed frame: {e}");
                break;
            }
        };
        debug!("inbound `{}` envelope from agent {token}", envelope.kind);

        // Correlated envelopes go to their waiter. A reply whose waiter is
        // already gone (timed out, abandoned) falls through and is treated
        // as agent-initiated.
        let envelope = match envelope.correlation_id.clone() {
            Some(correlation_id) => match broker.registry.deliver(&correlation_id, envelope) {
                Ok(()) => continue,
                Err(unclaimed) => unclaimed,
            },
            None => envelope,
        };

        if let Err(e) = broker.handler.handle(&token, envelope, &connection).await {
            warn!("unsolicited task from agent {token} failed: {e:#}");
        }
    }

    broker.disconnect(&connection).await;
}
