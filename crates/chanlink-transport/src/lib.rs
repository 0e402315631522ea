//! Byte-stream transports for chanlink.
//!
//! Provides the raw channels the session layer is built on:
//! - Unix domain sockets for the baseline control channel
//! - Connected socket pairs with descriptor passing for the framed pipe upgrade
//! - TCP listeners on the first free port of a range, fronted by TLS with a
//!   process-local self-signed identity
//!
//! This is the lowest layer of chanlink. Everything else builds on top of
//! the [`IpcStream`] type and the TLS material provided here.

pub mod error;
pub mod tcp;
pub mod tls;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use tcp::{bind_first_free, DEFAULT_PORT_RANGE};
pub use tls::{client_config, is_identity_mismatch, ServerIdentity};
pub use traits::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
