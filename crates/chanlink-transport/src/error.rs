use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Every port in the configured range is taken.
    #[error("no free port on {host} in range {start}-{end}")]
    NoFreePort { host: String, start: u16, end: u16 },

    /// A descriptor could not be sent or received as ancillary data.
    #[error("descriptor passing failed: {0}")]
    FdPassing(String),

    /// Generating the self-signed certificate failed.
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    /// The identity string cannot be used as a certificate name.
    #[error("invalid server identity '{0}'")]
    InvalidIdentity(String),

    /// TLS configuration or protocol error.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
