//! Line framing
//!
//! Splits the raw inbound byte stream into discrete protocol lines. grblHAL
//! terminates lines with `\r\n` or bare `\n`; terminators are stripped and
//! blank lines suppressed. Partial lines are buffered across chunk boundaries.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Incremental line assembler for arbitrary byte chunks.
///
/// The protocol is ASCII in practice; non-UTF-8 bytes are replaced lossily
/// rather than failing the stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every complete line it closes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if let Some(line) = take_line(&mut self.buffer) {
                    lines.push(line);
                }
            } else {
                self.buffer.push(byte);
            }
        }
        lines
    }

    /// Number of buffered bytes belonging to an unterminated line.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Drain the buffer into a line, stripping a trailing `\r` and suppressing
/// blanks.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    if buffer.is_empty() {
        return None;
    }
    let line = String::from_utf8_lossy(buffer).into_owned();
    buffer.clear();
    Some(line)
}

/// `tokio_util` codec over the same framing rules, for use with
/// `FramedRead`/`FramedWrite` on the session transport.
#[derive(Debug, Default)]
pub struct LineCodec {
    next_index: usize,
}

impl LineCodec {
    /// Create a codec with an empty scan state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|&b| b == b'\n') else {
                // No terminator yet; remember how far we scanned.
                self.next_index = src.len();
                return Ok(None);
            };
            let newline_index = self.next_index + offset;
            let mut line = src.split_to(newline_index + 1);
            self.next_index = 0;

            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        // A final unterminated line is still a line once the stream closes.
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        self.next_index = 0;
        let mut bytes = rest.chunk();
        if bytes.last() == Some(&b'\r') {
            bytes = &bytes[..bytes.len() - 1];
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
