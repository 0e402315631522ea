use std::path::PathBuf;
use std::sync::Arc;

use crate::protocol::MessageError;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// No service is listening at the configured address.
    #[error("no service listening at {}", path.display())]
    NoSuchService { path: PathBuf },

    /// The baseline connection could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] chanlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] chanlink_frame::FrameError),

    /// Bind handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer violated the protocol. Never recovered by falling back.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The secure socket peer presented a certificate for another identity.
    #[error("untrusted peer: certificate does not match identity '{expected}'")]
    UntrustedPeer { expected: String },

    /// The server rejected the upgrade request.
    #[error("upgrade declined: {0}")]
    UpgradeDeclined(String),

    /// The server answered the round with an ERROR message.
    #[error("server error {}: {}", .0.code, .0.description)]
    Application(MessageError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The session was closed locally.
    #[error("session closed")]
    Closed,
}

impl ChannelError {
    /// Whether this error is fatal to an upgrade attempt.
    ///
    /// Protocol errors are surfaced to the caller; every other upgrade
    /// failure degrades the session to the baseline channel.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::UntrustedPeer { .. })
    }
}

/// Error as delivered through a response stream, shared by all subscribers.
pub type SharedError = Arc<ChannelError>;

pub type Result<T> = std::result::Result<T, ChannelError>;
