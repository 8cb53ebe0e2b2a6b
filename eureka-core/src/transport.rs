//! Transport seam: open one session per channel against a resolved endpoint.
//! Implementations: TcpTransport (JSON lines over TCP) and LoopbackTransport (in-process).

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::DiscoveryError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Errors are `DiscoveryError::Connection`; the caller decides whether to try another endpoint.
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, DiscoveryError>;
}

/// Reliable, in-order message session. Owned by exactly one channel task.
#[async_trait]
pub trait Session: Send {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), DiscoveryError>;

    /// Next server message; `Ok(None)` once the server closed the session.
    /// Cancel-safe: dropping the future never loses a message, so it can sit in `select!`.
    async fn recv(&mut self) -> Result<Option<ServerMessage>, DiscoveryError>;

    /// Release the session. Default just drops it.
    async fn close(self: Box<Self>) {}
}
