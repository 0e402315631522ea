use std::net::TcpListener;
use std::ops::RangeInclusive;

use tracing::{debug, trace};

use crate::error::{Result, TransportError};

/// Port range scanned by the secure socket transport.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 4001..=5999;

/// Bind a TCP listener on the first free port in `range`.
///
/// Ports that are taken (or otherwise refuse to bind) are skipped. Fails
/// with [`TransportError::NoFreePort`] when the whole range is exhausted.
pub fn bind_first_free(host: &str, range: RangeInclusive<u16>) -> Result<TcpListener> {
    let (start, end) = (*range.start(), *range.end());
    for port in range {
        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                debug!(host, port, "bound tcp listener");
                return Ok(listener);
            }
            Err(err) => trace!(host, port, error = %err, "port unavailable"),
        }
    }
    Err(TransportError::NoFreePort {
        host: host.to_string(),
        start,
        end,
    })
}
