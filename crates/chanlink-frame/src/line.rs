//! Newline-delimited text framing.
//!
//! Every message is one line terminated by `\n`. Inside a line, a payload
//! backslash is written as `\\` and a payload newline as `\n`, so any string
//! survives the trip, including ones that contain line breaks.

use bytes::{BufMut, BytesMut};

use crate::codec::DEFAULT_MAX_PAYLOAD;
use crate::error::{FrameError, Result};

/// Append `payload` to `dst` as one escaped, newline-terminated line.
pub fn encode_line(payload: &str, dst: &mut BytesMut) {
    dst.reserve(payload.len() + 1);
    for byte in payload.bytes() {
        match byte {
            b'\\' => dst.put_slice(b"\\\\"),
            b'\n' => dst.put_slice(b"\\n"),
            other => dst.put_u8(other),
        }
    }
    dst.put_u8(b'\n');
}

/// Incremental line decoder.
///
/// Feed it whatever chunks the stream produces; complete lines come out in
/// order and an unterminated tail is kept for the next chunk.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    max_line: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl LineDecoder {
    /// Create a decoder that rejects lines longer than `max_line` bytes.
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line,
        }
    }

    /// Append raw bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete line, unescaped.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        let Some(end) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > self.max_line {
                return Err(FrameError::PayloadTooLarge {
                    size: self.buf.len(),
                    max: self.max_line,
                });
            }
            return Ok(None);
        };

        let raw = self.buf.split_to(end + 1);
        let escaped = &raw[..end];
        if escaped.len() > self.max_line {
            return Err(FrameError::PayloadTooLarge {
                size: escaped.len(),
                max: self.max_line,
            });
        }
        Ok(Some(unescape(escaped)?))
    }

    /// Whether a partial line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

fn unescape(escaped: &[u8]) -> Result<String> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(&byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(&other) => return Err(FrameError::InvalidEscape(other as char)),
            None => return Err(FrameError::InvalidEscape(' ')),
        }
    }
    Ok(String::from_utf8(out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &str) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_line(payload, &mut out);
        out.to_vec()
    }

    #[test]
    fn escapes_backslash_and_newline() {
        assert_eq!(encode("plain"), b"plain\n");
        assert_eq!(encode("a\nb"), b"a\\nb\n");
        assert_eq!(encode("c:\\n"), b"c:\\\\n\n");
    }

    #[test]
    fn decodes_lines_split_across_chunks() {
        let mut wire = BytesMut::new();
        for payload in ["ping", "multi\nline", "back\\slash", ""] {
            encode_line(payload, &mut wire);
        }

        let mut decoder = LineDecoder::default();
        let mut seen = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.push(chunk);
            while let Some(line) = decoder.next_line().unwrap() {
                seen.push(line);
            }
        }
        assert_eq!(seen, vec!["ping", "multi\nline", "back\\slash", ""]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn keeps_unterminated_tail() {
        let mut decoder = LineDecoder::default();
        decoder.push(b"first\nsec");
        assert_eq!(decoder.next_line().unwrap().as_deref(), Some("first"));
        assert_eq!(decoder.next_line().unwrap(), None);
        assert!(decoder.has_partial());

        decoder.push(b"ond\n");
        assert_eq!(decoder.next_line().unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn rejects_unknown_escape() {
        let mut decoder = LineDecoder::default();
        decoder.push(b"bad\\t\n");
        assert!(matches!(
            decoder.next_line(),
            Err(FrameError::InvalidEscape('t'))
        ));
    }

    #[test]
    fn rejects_overlong_line_without_terminator() {
        let mut decoder = LineDecoder::new(8);
        decoder.push(b"0123456789");
        assert!(matches!(
            decoder.next_line(),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }
}
