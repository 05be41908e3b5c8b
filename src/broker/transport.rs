use anyhow::Result;
use async_trait::async_trait;

/// Write half of an agent transport.
///
/// The broker owns one boxed sink per connection behind an async lock, so
/// concurrent dispatchers serialize their frames instead of interleaving.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send_text(&mut self, frame: String) -> Result<()>;
}

/// Read half of an agent transport.
///
/// `Ok(None)` is a clean close; `Err` is a transport failure. Either ends
/// the connection's reader loop.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next text frame.
    async fn recv_text(&mut self) -> Result<Option<String>>;
}
