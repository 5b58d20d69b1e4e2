use thiserror::Error;

/// Connection-level failures. These are surfaced as events and never
/// returned to callers; the transport keeps retrying on its own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket factory refused to construct a socket (malformed URI,
    /// unsupported scheme). Fatal for the attempt; no retry is scheduled.
    #[error("could not open a socket to {uri}: {reason}")]
    ConnectionFailed { uri: String, reason: String },

    /// The connection to the signaling gateway ended unexpectedly.
    #[error("signaling connection ended unexpectedly")]
    ConnectionDisconnected,

    /// A publish was attempted while no socket was open. Informational; the
    /// message is buffered when it is retryable.
    #[error("no transport available to send a message")]
    TransportUnavailable,
}

impl TransportError {
    /// Stable numeric code carried on the event surface.
    pub fn code(&self) -> u32 {
        match self {
            TransportError::ConnectionFailed { .. } => 53000,
            TransportError::ConnectionDisconnected => 53001,
            TransportError::TransportUnavailable => 53009,
        }
    }
}

/// A typed error delivered on the client event bus: either a decorated
/// error frame from the server or a local transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingError {
    pub code: u32,
    pub message: String,
}

impl From<&TransportError> for SignalingError {
    fn from(err: &TransportError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
