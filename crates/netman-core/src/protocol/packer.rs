//! Length-prefixed packer used by raw (non-WebSocket) connections.
//!
//! Wire format:
//! ```text
//! [body_len:4][body:body_len]
//! ```
//! The length is a big-endian `u32`.  A configured maximum of `0` means the
//! body length is unlimited (up to `u32::MAX`).
//!
//! # Streaming decode (for beginners)
//!
//! TCP delivers a byte *stream*, not a sequence of messages.  One read may
//! return half a header; the next may return the rest of the header, a whole
//! body and the first byte of the following frame.  [`LengthPrefixCodec::decode`]
//! therefore works on an accumulation buffer: it only consumes bytes once a
//! complete frame is present, and otherwise leaves everything in place.

use bytes::{Buf, BytesMut};

use super::FrameError;

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

const RESERVE_CAP: usize = 64 * 1024;

/// Encoder/decoder for the `[u32 BE length][body]` wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LengthPrefixCodec {
    max_body_len: u32,
}

impl LengthPrefixCodec {
    /// Creates a codec that rejects bodies longer than `max_body_len`
    /// (`0` = unlimited).
    pub fn new(max_body_len: u32) -> Self {
        Self { max_body_len }
    }

    pub fn max_body_len(&self) -> u32 {
        self.max_body_len
    }

    /// Frames `body` with its length header.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLarge`] if the body does not fit in a
    /// `u32` length field.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use netman_core::protocol::LengthPrefixCodec;
    ///
    /// let bytes = LengthPrefixCodec::new(0).encode(b"hello").unwrap();
    /// assert_eq!(bytes, [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
    /// ```
    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let len = u32::try_from(body.len()).map_err(|_| FrameError::BodyTooLarge(body.len()))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(body);
        Ok(buf)
    }

    /// Takes one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the header or body is still incomplete; the
    /// buffer is left untouched in that case.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyLenExceedLimit`] as soon as a header
    /// declares a body longer than the configured maximum, without waiting
    /// for the body to arrive.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if self.max_body_len > 0 && declared > self.max_body_len {
            return Err(FrameError::BodyLenExceedLimit {
                declared: u64::from(declared),
                limit: self.max_body_len,
            });
        }

        let total = HEADER_LEN + declared as usize;
        if buf.len() < total {
            // Grow ahead of the body, but never trust the header for more
            // than one read's worth of memory.
            buf.reserve((total - buf.len()).min(RESERVE_CAP));
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let body = buf.split_to(declared as usize).to_vec();
        Ok(Some(body))
    }

    /// Checks what is left in the buffer once the peer has closed its side.
    ///
    /// A dangling partial header is reported as
    /// [`FrameError::HeadBytesLengthFail`]; a partial body or an empty buffer
    /// is not an error (the stream simply ended).
    pub fn check_eof(&self, buf: &BytesMut) -> Result<(), FrameError> {
        if !buf.is_empty() && buf.len() < HEADER_LEN {
            return Err(FrameError::HeadBytesLengthFail {
                buffered: buf.len(),
                needed: HEADER_LEN,
            });
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
