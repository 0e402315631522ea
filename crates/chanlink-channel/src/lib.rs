//! Channel sessions between a client and a local service.
//!
//! Every session starts on the baseline channel: a Unix domain socket that
//! carries JSON envelopes tagged with a session id. A session declared as
//! `framed-pipe` or `secure-socket` then asks the service for a second,
//! dedicated transport and moves its traffic there; when that negotiation
//! fails for any reason other than a protocol violation the session quietly
//! stays on the baseline channel.
//!
//! - [`ClientSession`] drives the client state machine.
//! - [`ChannelService`] accepts baseline connections and admits sessions into
//!   a [`SessionRegistry`], handing each new one to a [`ChannelHandler`].

pub mod baseline;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod link;
pub mod pipe;
pub mod protocol;
pub mod secure;
pub mod server;
pub mod stream;

pub use baseline::{BaselineChannel, ReplyHandle};
pub use client::{ClientConfig, ClientSession, SessionState};
pub use error::{ChannelError, Result, SharedError};
pub use handshake::{bind_client, bind_server, BindRequest, BindResponse, HandshakeConfig};
pub use link::{DisconnectReason, TransportEvents, UpgradedLink};
pub use pipe::FramedPipe;
pub use protocol::{
    ChannelType, ConnectionParams, Envelope, Message, MessageError, MessageKind, SessionId,
    UpgradeOffer, CLOSE_SENTINEL, PROTOCOL_NAME, PROTOCOL_VERSION, UPGRADE_REQUEST,
};
pub use secure::{SecureSocket, SecureSocketConfig};
pub use server::{
    CallerIdentity, ChannelHandler, ChannelService, ClientListener, RunningService,
    ServerSession, ServiceConfig, ServiceHandle, SessionRegistry,
};
pub use stream::{MessageStream, ResponseStream, StreamEvent, StreamHub};
