//! Client/server channel sessions with negotiated transport upgrades.
//!
//! A client binds a session over a Unix domain socket and, depending on the
//! channel type it declares, moves its traffic onto a framed socket pair or
//! a TLS connection negotiated through that first socket.
//!
//! # Crate Structure
//!
//! - [`transport`]: sockets, descriptor passing, TLS identities
//! - [`frame`]: length-prefixed frames and escaped text lines
//! - [`channel`]: sessions, upgrade negotiation and the server registry
//!
//! The most used types are re-exported at the crate root.

/// Re-export transport types.
pub mod transport {
    pub use chanlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use chanlink_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use chanlink_channel::*;
}

pub use chanlink_channel::{
    CallerIdentity, ChannelError, ChannelHandler, ChannelService, ChannelType, ClientConfig,
    ClientListener, ClientSession, ResponseStream, RunningService, ServerSession, ServiceConfig,
    ServiceHandle, SessionId, SessionState, StreamEvent,
};
