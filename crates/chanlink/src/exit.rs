use std::fmt;
use std::io;

use chanlink_channel::ChannelError;
use chanlink_frame::FrameError;
use chanlink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const NO_SERVICE: i32 = 69;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => NO_SERVICE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: &ChannelError) -> CliError {
    let code = match err {
        ChannelError::NoSuchService { .. } => NO_SERVICE,
        ChannelError::Connection(_) | ChannelError::Disconnected(_) | ChannelError::Closed => {
            FAILURE
        }
        ChannelError::Transport(_) => TRANSPORT_ERROR,
        ChannelError::Frame(FrameError::PayloadTooLarge { .. }) => DATA_INVALID,
        ChannelError::Frame(_) => TRANSPORT_ERROR,
        ChannelError::Protocol(_)
        | ChannelError::UntrustedPeer { .. }
        | ChannelError::HandshakeFailed(_) => TRANSPORT_ERROR,
        ChannelError::Json(_) => DATA_INVALID,
        ChannelError::Timeout(_) => TIMEOUT,
        ChannelError::Application(_) | ChannelError::UpgradeDeclined(_) => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}

/// Owned variant for paths that do not keep the error around.
pub fn owned_channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Transport(err) => transport_error(context, err),
        ChannelError::Frame(err) => frame_error(context, err),
        other => channel_error(context, &other),
    }
}
