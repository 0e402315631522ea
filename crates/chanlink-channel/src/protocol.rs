//! Wire vocabulary shared by clients and servers.
//!
//! Every baseline frame after the bind handshake carries one JSON
//! [`Envelope`]. The answer to an [`UPGRADE_REQUEST`] travels in an
//! envelope of its own kind, so no application payload can pass for it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChannelError, Result};

/// Protocol name exchanged in the bind handshake.
pub const PROTOCOL_NAME: &str = "chanlink";

/// Protocol version exchanged in the bind handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Request payload that asks the server to negotiate an upgraded transport.
///
/// Reserved only for sessions declared with a non-baseline channel type; a
/// baseline session may send it as ordinary data.
pub const UPGRADE_REQUEST: &str = "connect";

/// Line or frame that ends an upgraded transport gracefully.
pub const CLOSE_SENTINEL: &str = "__chanlink_close__";

/// Client-generated identifier shared by all rounds of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport a session is declared with at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Baseline,
    FramedPipe,
    SecureSocket,
}

impl ChannelType {
    /// Whether sessions of this type negotiate a second transport.
    pub fn is_upgraded(self) -> bool {
        !matches!(self, Self::Baseline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::FramedPipe => "framed-pipe",
            Self::SecureSocket => "secure-socket",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "baseline" => Ok(Self::Baseline),
            "framed-pipe" | "pipe" => Ok(Self::FramedPipe),
            "secure-socket" | "socket" | "tls" => Ok(Self::SecureSocket),
            other => Err(format!(
                "unknown channel type '{other}' (expected baseline, framed-pipe or secure-socket)"
            )),
        }
    }
}

/// Envelope kinds carried by the baseline channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    EndStream,
    Error,
    Offer,
}

/// Application error carried by an ERROR message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    pub code: String,
    pub description: String,
}

impl MessageError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

/// A decoded baseline message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(String),
    Response(String),
    EndStream,
    Error(MessageError),
    Offer(UpgradeOffer),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
            Self::EndStream => MessageKind::EndStream,
            Self::Error(_) => MessageKind::Error,
            Self::Offer(_) => MessageKind::Offer,
        }
    }

    /// Wrap this message for `session_id`.
    pub fn into_envelope(self, session_id: SessionId, sender: &str) -> Envelope {
        let kind = self.kind();
        let payload = match self {
            Self::Request(payload) | Self::Response(payload) => Some(payload),
            Self::EndStream => None,
            // Only string fields; serialization cannot fail.
            Self::Error(err) => Some(serde_json::to_string(&err).unwrap_or_default()),
            Self::Offer(offer) => Some(offer.to_payload().unwrap_or_default()),
        };
        Envelope {
            kind,
            session_id,
            sender: sender.to_string(),
            payload,
        }
    }
}

/// One baseline frame: kind, session, sender and optional payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub session_id: SessionId,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and check that the payload matches the kind.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|e| ChannelError::Protocol(format!("malformed envelope: {e}")))?;
        if envelope.kind != MessageKind::EndStream && envelope.payload.is_none() {
            return Err(ChannelError::Protocol(format!(
                "{:?} envelope without payload",
                envelope.kind
            )));
        }
        Ok(envelope)
    }

    /// Split into session id and decoded message.
    pub fn into_message(self) -> Result<(SessionId, Message)> {
        let payload = self.payload.unwrap_or_default();
        let message = match self.kind {
            MessageKind::Request => Message::Request(payload),
            MessageKind::Response => Message::Response(payload),
            MessageKind::EndStream => Message::EndStream,
            MessageKind::Error => Message::Error(
                serde_json::from_str(&payload)
                    .map_err(|e| ChannelError::Protocol(format!("malformed error payload: {e}")))?,
            ),
            MessageKind::Offer => Message::Offer(UpgradeOffer::parse(&payload)?),
        };
        Ok((self.session_id, message))
    }
}

/// Where the client should dial for a secure socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host_address: String,
    pub port: u16,
}

/// Server answer to an [`UPGRADE_REQUEST`], sent as [`Message::Offer`].
///
/// A `FramedPipe` offer carries the client's pipe end as a descriptor on the
/// same baseline frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum UpgradeOffer {
    FramedPipe,
    SecureSocket(ConnectionParams),
    Declined { reason: String },
}

impl UpgradeOffer {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| ChannelError::Protocol(format!("malformed upgrade offer: {e}")))
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
