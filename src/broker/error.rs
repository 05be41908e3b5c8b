use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the dispatch API and the connection machinery.
///
/// A reply whose payload says `"status": "failed"` is not one of these: the
/// remote task failed, the broker did its job, and the envelope is handed to
/// the caller as data. These variants cover the broker's own failure modes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Dispatch against a token with no live connection.
    #[error("no active connection for agent `{token}`")]
    NoActiveConnection { token: String },

    /// No reply arrived within the caller's bound. The pending waiter is
    /// removed before this propagates.
    #[error("timed out after {timeout:?} waiting for a `{kind}` reply")]
    Timeout { kind: String, timeout: Duration },

    /// Malformed inbound frame. Fatal to the connection it arrived on,
    /// never to the process.
    #[error("failed to decode frame: {message}")]
    Decode { message: String },

    /// Encoding or socket failure while talking to an agent.
    #[error("transport failure: {message}")]
    Transport { message: String },
}
