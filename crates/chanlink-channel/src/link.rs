//! Upgraded transports as seen by sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::pipe::FramedPipe;
use crate::protocol::ChannelType;
use crate::secure::SecureSocket;

/// Why an upgraded transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent the close sentinel.
    CloseSignal,
    /// This side closed the transport.
    LocalClose,
    /// The transport failed or the peer vanished without the sentinel.
    Failed(String),
}

/// Callbacks from an upgraded transport's I/O thread.
pub trait TransportEvents: Send + Sync + 'static {
    fn on_message(&self, message: String);
    fn on_disconnect(&self, reason: DisconnectReason);
}

/// Forwards events and reports the disconnect at most once.
pub(crate) struct EventGate {
    events: Arc<dyn TransportEvents>,
    disconnected: AtomicBool,
}

impl EventGate {
    pub(crate) fn new(events: Arc<dyn TransportEvents>) -> Self {
        Self {
            events,
            disconnected: AtomicBool::new(false),
        }
    }

    pub(crate) fn message(&self, message: String) {
        if !self.disconnected.load(Ordering::Acquire) {
            self.events.on_message(message);
        }
    }

    /// Returns `true` if this call delivered the notification.
    pub(crate) fn disconnect(&self, reason: DisconnectReason) -> bool {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.events.on_disconnect(reason);
        true
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

/// The second transport a session negotiated.
#[derive(Clone)]
pub enum UpgradedLink {
    FramedPipe(FramedPipe),
    SecureSocket(SecureSocket),
}

impl UpgradedLink {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            Self::FramedPipe(_) => ChannelType::FramedPipe,
            Self::SecureSocket(_) => ChannelType::SecureSocket,
        }
    }

    pub fn send(&self, message: &str) -> bool {
        match self {
            Self::FramedPipe(pipe) => pipe.write(message),
            Self::SecureSocket(socket) => socket.send(message),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::FramedPipe(pipe) => pipe.is_open(),
            Self::SecureSocket(socket) => socket.is_connected(),
        }
    }

    /// Send the close sentinel, then close.
    pub fn close_gracefully(&self) -> bool {
        match self {
            Self::FramedPipe(pipe) => pipe.close_gracefully(),
            Self::SecureSocket(socket) => socket.close_gracefully(),
        }
    }

    pub fn close(&self) {
        match self {
            Self::FramedPipe(pipe) => pipe.close(),
            Self::SecureSocket(socket) => socket.close(),
        }
    }
}

impl std::fmt::Debug for UpgradedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedLink")
            .field("channel_type", &self.channel_type())
            .field("connected", &self.is_connected())
            .finish()
    }
}
