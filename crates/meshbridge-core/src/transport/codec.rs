//! Stream framing shared by byte-stream transports
//!
//! Serial and TCP radios wrap every radio frame as:
//! - Bytes 0-1: Magic (0x94C3)
//! - Bytes 2-3: Length (big-endian u16)
//! - Bytes 4+: Frame
//!
//! A zero-length frame is a heartbeat and never surfaces to callers.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::STREAM_MAGIC;
use crate::error::{BridgeError, Result};

/// Largest frame accepted from or written to a stream
pub const MAX_STREAM_FRAME: usize = 512;

/// Magic + length
const STREAM_HEADER_LEN: usize = 4;

const MAGIC_HI: u8 = (STREAM_MAGIC >> 8) as u8;
const MAGIC_LO: u8 = (STREAM_MAGIC & 0xFF) as u8;

/// Incremental decoder for the stream framing
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: BytesMut,
}

impl StreamFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_STREAM_FRAME * 2),
        }
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop any buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to extract the next complete frame.
    ///
    /// Garbage before a magic number is skipped. A length larger than
    /// [`MAX_STREAM_FRAME`] is reported as a protocol error after skipping
    /// the bad magic so the next call can resynchronize.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.buffer.len() < STREAM_HEADER_LEN {
                return Ok(None);
            }

            if self.buffer[0] != MAGIC_HI || self.buffer[1] != MAGIC_LO {
                match self.find_magic() {
                    Some(pos) => {
                        warn!(discarded = pos, "Discarding bytes before magic number");
                        self.buffer.advance(pos);
                    }
                    None => {
                        // Keep a trailing first magic byte, it may be half a header
                        let keep = usize::from(self.buffer.last() == Some(&MAGIC_HI));
                        let discard = self.buffer.len() - keep;
                        if discard > 0 {
                            warn!(discarded = discard, "Discarding buffer without magic");
                            self.buffer.advance(discard);
                        }
                        return Ok(None);
                    }
                }
                continue;
            }

            let length = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
            if length > MAX_STREAM_FRAME {
                self.buffer.advance(2);
                return Err(BridgeError::InvalidFrame(format!(
                    "stream frame length {} exceeds maximum {}",
                    length, MAX_STREAM_FRAME
                )));
            }

            let total = STREAM_HEADER_LEN + length;
            if self.buffer.len() < total {
                trace!(
                    have = self.buffer.len(),
                    need = total,
                    "Waiting for complete frame"
                );
                return Ok(None);
            }

            let mut frame = self.buffer.split_to(total);
            frame.advance(STREAM_HEADER_LEN);
            if frame.is_empty() {
                trace!("Heartbeat frame");
                continue;
            }
            debug!(size = frame.len(), "Received complete frame");
            return Ok(Some(frame.freeze()));
        }
    }

    fn find_magic(&self) -> Option<usize> {
        self.buffer
            .windows(2)
            .position(|w| w[0] == MAGIC_HI && w[1] == MAGIC_LO)
    }
}

/// Wrap a frame with the stream header
pub fn encode_stream_frame(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() > MAX_STREAM_FRAME {
        return Err(BridgeError::InvalidFrame(format!(
            "frame of {} bytes exceeds maximum {}",
            frame.len(),
            MAX_STREAM_FRAME
        )));
    }
    let mut packet = Vec::with_capacity(STREAM_HEADER_LEN + frame.len());
    packet.extend_from_slice(&STREAM_MAGIC.to_be_bytes());
    packet.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    packet.extend_from_slice(frame);
    Ok(packet)
}

/// A heartbeat: header with zero length
pub fn heartbeat() -> [u8; STREAM_HEADER_LEN] {
    let magic = STREAM_MAGIC.to_be_bytes();
    [magic[0], magic[1], 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_stream_frame() {
        let framed = encode_stream_frame(b"hello").unwrap();
        assert_eq!(framed[0], 0x94);
        assert_eq!(framed[1], 0xC3);
        assert_eq!(u16::from_be_bytes([framed[2], framed[3]]), 5);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_parse_complete_frame() {
        let mut framer = StreamFramer::new();
        framer.push(&encode_stream_frame(b"test").unwrap());
        assert_eq!(framer.next_frame().unwrap().unwrap().as_ref(), b"test");
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_parse_partial_frame() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x94, 0xC3, 0x00, 0x05, b'a']);
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.buffered(), 5);

        framer.push(b"bcde");
        assert_eq!(framer.next_frame().unwrap().unwrap().as_ref(), b"abcde");
    }

    #[test]
    fn test_skip_garbage_before_magic() {
        let mut framer = StreamFramer::new();
        framer.push(b"garbage");
        framer.push(&encode_stream_frame(b"test").unwrap());
        assert_eq!(framer.next_frame().unwrap().unwrap().as_ref(), b"test");
    }

    #[test]
    fn test_heartbeat_is_skipped() {
        let mut framer = StreamFramer::new();
        framer.push(&heartbeat());
        framer.push(&encode_stream_frame(b"after").unwrap());
        assert_eq!(framer.next_frame().unwrap().unwrap().as_ref(), b"after");
    }

    #[test]
    fn test_oversized_length_resyncs() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x94, 0xC3, 0xFF, 0xFF]);
        framer.push(&encode_stream_frame(b"ok").unwrap());
        assert!(framer.next_frame().unwrap_err().is_protocol_error());
        assert_eq!(framer.next_frame().unwrap().unwrap().as_ref(), b"ok");
    }

    #[test]
    fn test_encode_rejects_oversized() {
        assert!(encode_stream_frame(&[0u8; MAX_STREAM_FRAME + 1]).is_err());
    }
}
