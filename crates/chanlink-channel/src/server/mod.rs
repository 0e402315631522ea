//! Server side: session registry, per-session state and the service loop.

mod registry;
mod service;
mod session;

use std::sync::Arc;

use chanlink_transport::ServerIdentity;

pub use registry::{ChannelHandler, SessionRegistry};
pub use service::{ChannelService, RunningService, ServiceConfig, ServiceHandle};
pub use session::{CallerIdentity, ClientListener, ServerSession};

use crate::baseline::BaselineChannel;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::secure::SecureSocketConfig;

/// Shared state every session of one service needs.
pub(crate) struct SessionContext {
    pub(crate) baseline: Arc<BaselineChannel>,
    pub(crate) identity: Arc<ServerIdentity>,
    pub(crate) secure: SecureSocketConfig,
    pub(crate) dispatcher: Dispatcher,
}

impl SessionContext {
    pub(crate) fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            baseline: Arc::new(BaselineChannel::new(config.server_identity.clone())),
            identity: Arc::new(ServerIdentity::generate(&config.server_identity)?),
            secure: config.secure_socket.clone(),
            dispatcher: Dispatcher::spawn("chanlink-listeners")?,
        })
    }
}
