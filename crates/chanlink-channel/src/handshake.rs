//! Bind handshake on a fresh baseline connection.
//!
//! The client announces the session it wants to bind and its declared
//! channel type; the server answers with its identity, which the client
//! later expects to find in a secure socket certificate.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use chanlink_frame::{FrameError, FrameReader, FrameWriter};
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::protocol::{ChannelType, SessionId, PROTOCOL_NAME, PROTOCOL_VERSION};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_SESSION_ID_LEN: usize = 128;
const MAX_SENDER_LEN: usize = 256;
const MAX_IDENTITY_LEN: usize = 253;

/// First frame sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindRequest {
    pub protocol: String,
    pub version: String,
    pub session_id: SessionId,
    pub channel_type: ChannelType,
    /// Free-form name of the calling application.
    pub sender: String,
}

/// Server answer to a [`BindRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindResponse {
    pub protocol: String,
    pub version: String,
    /// Name the server's secure socket certificate is issued for.
    pub server_identity: String,
}

/// Configuration for handshake negotiation.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("protocol", &format_args!("{}/{}", self.protocol_name, self.protocol_version))
            .field("max_handshake_payload", &self.max_handshake_payload)
            .finish()
    }
}

/// Client side: send the bind request and wait for the server's answer.
pub fn bind_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    session_id: &SessionId,
    channel_type: ChannelType,
    sender: &str,
    config: &HandshakeConfig,
) -> Result<BindResponse> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_len("session_id", session_id.as_str(), MAX_SESSION_ID_LEN)?;
    validate_len("sender", sender, MAX_SENDER_LEN)?;

    let req = BindRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        session_id: session_id.clone(),
        channel_type,
        sender: sender.to_string(),
    };
    send_json(writer, &req)?;

    let deadline = Instant::now() + config.timeout;
    let payload = recv_payload(reader, deadline, config.timeout, config.max_handshake_payload)?;
    let resp: BindResponse = serde_json::from_slice(&payload)?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;
    validate_len("server_identity", &resp.server_identity, MAX_IDENTITY_LEN)?;

    if resp.protocol != config.protocol_name {
        return Err(ChannelError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(ChannelError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }

    Ok(resp)
}

/// Server side: read and validate a bind request, then answer it.
pub fn bind_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    server_identity: &str,
    config: &HandshakeConfig,
) -> Result<BindRequest> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_len("server_identity", server_identity, MAX_IDENTITY_LEN)?;

    let deadline = Instant::now() + config.timeout;
    let payload = recv_payload(reader, deadline, config.timeout, config.max_handshake_payload)?;
    let req: BindRequest = serde_json::from_slice(&payload)?;

    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;
    validate_len("session_id", req.session_id.as_str(), MAX_SESSION_ID_LEN)?;
    validate_len("sender", &req.sender, MAX_SENDER_LEN)?;

    if req.protocol != config.protocol_name {
        return Err(ChannelError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&req.version, &config.protocol_version)? {
        return Err(ChannelError::HandshakeFailed(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        )));
    }

    let resp = BindResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        server_identity: server_identity.to_string(),
    };
    send_json(writer, &resp)?;

    Ok(req)
}

fn send_json<T: Serialize, W: Write>(writer: &mut FrameWriter<W>, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    writer.send(&payload)?;
    Ok(())
}

fn recv_payload<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
    max_handshake_payload: usize,
) -> Result<Vec<u8>> {
    loop {
        if Instant::now() >= deadline {
            return Err(ChannelError::Timeout(timeout));
        }

        match reader.read_frame() {
            Ok(frame) => {
                if frame.payload.len() > max_handshake_payload {
                    return Err(ChannelError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        frame.payload.len(),
                        max_handshake_payload
                    )));
                }
                return Ok(frame.payload.to_vec());
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(ChannelError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(ChannelError::Frame(err)),
        }
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn validate_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() || value.len() > max {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid {field} length: {}",
            value.len()
        )));
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |why: &str| {
        ChannelError::HandshakeFailed(format!("invalid version '{version}': {why}"))
    };
    let mut parts = version.split('.');

    let major = parts.next().ok_or_else(|| invalid("missing major"))?;
    let minor = parts.next().ok_or_else(|| invalid("missing minor"))?;
    if parts.next().is_some() {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;

    Ok((major, minor))
}
