use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, DEFAULT_MAX_PAYLOAD};
use crate::error::FrameError;

/// `tokio_util` codec for framed pipe text messages.
///
/// Same wire format as [`crate::FrameReader`]/[`crate::FrameWriter`], for
/// callers that drive a pipe end from an async runtime.
#[derive(Debug, Clone)]
pub struct PipeCodec {
    max_payload_size: usize,
}

impl PipeCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for PipeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for PipeCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_frame(src, self.max_payload_size)? {
            Some(frame) => Ok(Some(frame.into_text()?)),
            None => Ok(None),
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for PipeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.as_ref().as_bytes();
        if payload.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }
        encode_frame(payload, dst)
    }
}
