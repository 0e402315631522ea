//! Message framing for chanlink.
//!
//! Two wire formats live here:
//! - Length-prefixed frames, `u32` big-endian length followed by the payload
//!   bytes, used by the baseline control channel and the framed pipe
//! - Newline-delimited text lines with backslash escaping, used by the secure
//!   socket transport
//!
//! Partial reads and coalesced writes are handled here; callers always see
//! whole messages.

pub mod codec;
pub mod error;
pub mod line;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub mod tokio_codec;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use line::{encode_line, LineDecoder};
pub use reader::FrameReader;
pub use writer::FrameWriter;

#[cfg(feature = "async")]
pub use tokio_codec::PipeCodec;
