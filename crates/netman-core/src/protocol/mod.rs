//! Wire protocols: the length-prefixed packer, the WebSocket frame codec and
//! the HTTP upgrade that precedes WebSocket framing.
//!
//! Every decoder in this module works on a growing [`bytes::BytesMut`]
//! accumulation buffer.  A decoder either consumes exactly one complete unit
//! from the front of the buffer and returns it, or returns `Ok(None)` and
//! leaves the buffer untouched so the caller can append more bytes and try
//! again.  This is what lets a non-blocking socket deliver a frame split
//! across any number of reads.

use thiserror::Error;

pub mod message;
pub mod packer;
pub mod upgrade;
pub mod websocket;

pub use message::{Message, OpCode, Request};
pub use packer::LengthPrefixCodec;
pub use upgrade::{QueryParams, UpgradeRequest};
pub use websocket::Frame;

/// Errors raised while turning a byte stream into frames.
///
/// Every variant is fatal for the connection that produced it; "need more
/// data" is never an error and is reported as `Ok(None)` instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The stream ended part-way through a length header.
    #[error("stream ended inside a frame header ({buffered} of {needed} bytes)")]
    HeadBytesLengthFail { buffered: usize, needed: usize },

    /// The declared body length is larger than the configured maximum.
    #[error("body length {declared} exceeds limit {limit}")]
    BodyLenExceedLimit { declared: u64, limit: u32 },

    /// The body is too large to be described by the wire format at all.
    #[error("body of {0} bytes cannot be encoded")]
    BodyTooLarge(usize),

    /// The bytes do not follow the wire format.
    #[error("malformed frame: {0}")]
    Malformed(String),
}
