use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// An event produced by a live socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The socket finished its handshake and is ready for frames.
    Opened,
    /// A text frame arrived from the server.
    Message(String),
    /// The socket hit an error. A `Closed` event follows; recovery is driven
    /// by that, not by this.
    Error(String),
    /// The socket is gone. `code` is the websocket close code when known.
    Closed { code: u16, reason: String },
}

/// One active connection. A dumb pipe for text frames with no knowledge of
/// the signaling protocol layered on top.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Writes one text frame to the server.
    async fn send(&self, frame: &str) -> Result<()>;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// A factory responsible for creating new socket instances, one per
/// connection attempt. Refusing to construct (malformed URI, unsupported
/// scheme) is fatal to the attempt; runtime dial failures must be reported
/// as `Closed` events on the returned receiver instead.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>)>;
}
