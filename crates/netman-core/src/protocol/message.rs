//! Decoded application messages and the request envelope handed to dispatch.

use std::fmt;
use std::str::Utf8Error;
use std::sync::{Arc, Weak};

use crate::connection::Connection;

/// WebSocket opcodes (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Control frames (close, ping, pong) may interleave with fragments and
    /// must carry at most 125 payload bytes.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(other),
        }
    }
}

/// One fully assembled application message.
///
/// Raw-mode messages carry no opcode; WebSocket messages carry the opcode of
/// the frame that opened them (text or binary).
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    opcode: Option<OpCode>,
    payload: Vec<u8>,
}

impl Message {
    /// Creates a raw-mode message.
    pub fn raw(payload: Vec<u8>) -> Self {
        Self {
            opcode: None,
            payload,
        }
    }

    /// Creates a WebSocket message with the given data opcode.
    pub fn websocket(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            opcode: Some(opcode),
            payload,
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        self.opcode
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True for WebSocket text messages.
    pub fn is_text(&self) -> bool {
        self.opcode == Some(OpCode::Text)
    }

    /// Interprets the payload as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns the UTF-8 error if the payload is not valid text.
    pub fn as_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("opcode", &self.opcode)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// A message together with a weak back-reference to the connection it came
/// from.
///
/// The reference is weak so that a request sitting in the outbound channel
/// never keeps a closed connection alive.  Handlers should upgrade it, use it
/// for the reply, and drop it before returning.
#[derive(Debug, Clone)]
pub struct Request {
    connection: Weak<Connection>,
    message: Message,
}

impl Request {
    pub fn new(connection: Weak<Connection>, message: Message) -> Self {
        Self {
            connection,
            message,
        }
    }

    /// Returns the originating connection if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_try_from_accepts_known_values() {
        assert_eq!(OpCode::try_from(0x1), Ok(OpCode::Text));
        assert_eq!(OpCode::try_from(0xA), Ok(OpCode::Pong));
    }

    #[test]
    fn test_opcode_try_from_rejects_reserved_values() {
        assert_eq!(OpCode::try_from(0x3), Err(0x3));
        assert_eq!(OpCode::try_from(0xB), Err(0xB));
    }

    #[test]
    fn test_control_opcodes_are_flagged() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test]
    fn test_text_message_reports_text_and_utf8() {
        let msg = Message::websocket(OpCode::Text, b"hello".to_vec());
        assert!(msg.is_text());
        assert_eq!(msg.as_str(), Ok("hello"));
        assert_eq!(msg.len(), 5);
    }

    #[test]
    fn test_raw_message_has_no_opcode() {
        let msg = Message::raw(vec![1, 2, 3]);
        assert_eq!(msg.opcode(), None);
        assert!(!msg.is_text());
    }

    #[test]
    fn test_request_with_dropped_connection_yields_none() {
        let request = Request::new(Weak::new(), Message::raw(b"x".to_vec()));
        assert!(request.connection().is_none());
        assert_eq!(request.message().bytes(), b"x");
    }
}
