//! Per-connection protocol state: turns the accumulation buffer into events.

use bytes::BytesMut;

use crate::options::Protocol;
use crate::protocol::message::{Message, OpCode};
use crate::protocol::upgrade::{self, QueryParams};
use crate::protocol::websocket::{self, Reassembler};
use crate::protocol::{FrameError, LengthPrefixCodec};

/// Something the connection has to act on after a read.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete application message.
    Deliver(Message),
    /// Protocol-level bytes to send back (pong).
    Reply(Vec<u8>),
    /// The WebSocket upgrade succeeded; `response` is the `101` reply.
    Upgraded { response: Vec<u8>, query: QueryParams },
    /// The peer sent a close frame.
    CloseRequested,
}

#[derive(Debug)]
pub enum Framer {
    Raw(LengthPrefixCodec),
    WebSocket(WebSocketState),
}

#[derive(Debug)]
pub struct WebSocketState {
    upgraded: bool,
    max_payload: u32,
    reassembler: Reassembler,
}

impl Framer {
    pub fn new(protocol: Protocol, max_body_length: u32) -> Self {
        match protocol {
            Protocol::Raw => Framer::Raw(LengthPrefixCodec::new(max_body_length)),
            Protocol::WebSocket => Framer::WebSocket(WebSocketState {
                upgraded: false,
                max_payload: max_body_length,
                reassembler: Reassembler::new(max_body_length),
            }),
        }
    }

    /// True once the connection may carry application messages.
    pub fn is_ready(&self) -> bool {
        match self {
            Framer::Raw(_) => true,
            Framer::WebSocket(ws) => ws.upgraded,
        }
    }

    /// Decodes as many complete units as `buf` holds, appending to `events`.
    ///
    /// Stops early after [`FrameEvent::CloseRequested`].
    ///
    /// # Errors
    ///
    /// Any [`FrameError`]; the connection must be closed.  Events pushed
    /// before the error are still valid.
    pub fn feed(&mut self, buf: &mut BytesMut, events: &mut Vec<FrameEvent>) -> Result<(), FrameError> {
        match self {
            Framer::Raw(codec) => {
                while let Some(body) = codec.decode(buf)? {
                    events.push(FrameEvent::Deliver(Message::raw(body)));
                }
                Ok(())
            }
            Framer::WebSocket(ws) => ws.feed(buf, events),
        }
    }

    /// Checks the leftover buffer when the peer has closed its side.
    pub fn on_eof(&self, buf: &BytesMut) -> Result<(), FrameError> {
        match self {
            Framer::Raw(codec) => codec.check_eof(buf),
            Framer::WebSocket(_) => Ok(()),
        }
    }

    /// Bytes to send right before the socket is torn down.
    pub fn farewell(&self) -> Option<&'static [u8]> {
        match self {
            Framer::WebSocket(ws) if ws.upgraded => Some(&websocket::CLOSE_FRAME[..]),
            _ => None,
        }
    }

    /// Bytes to send when decoding fails.
    pub fn rejection(&self) -> Option<&'static [u8]> {
        match self {
            Framer::WebSocket(ws) if !ws.upgraded => Some(upgrade::BAD_REQUEST),
            _ => None,
        }
    }

    /// Encodes an outbound application payload for this protocol.
    ///
    /// # Errors
    ///
    /// [`FrameError::BodyTooLarge`] when a raw body does not fit the length
    /// header.
    pub fn encode(&self, opcode: OpCode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        match self {
            Framer::Raw(codec) => codec.encode(payload),
            Framer::WebSocket(_) => Ok(websocket::encode_frame(true, opcode, payload)),
        }
    }
}

impl WebSocketState {
    fn feed(&mut self, buf: &mut BytesMut, events: &mut Vec<FrameEvent>) -> Result<(), FrameError> {
        if !self.upgraded {
            let Some(request) = upgrade::parse_upgrade(buf)? else {
                return Ok(());
            };
            self.upgraded = true;
            events.push(FrameEvent::Upgraded {
                response: request.response,
                query: request.query,
            });
        }

        while let Some(frame) = websocket::decode_frame(buf, self.max_payload)? {
            match frame.opcode {
                OpCode::Ping => events.push(FrameEvent::Reply(websocket::pong_frame(&frame.payload))),
                OpCode::Pong => {}
                OpCode::Close => {
                    events.push(FrameEvent::CloseRequested);
                    return Ok(());
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    if let Some(message) = self.reassembler.push(frame)? {
                        events.push(FrameEvent::Deliver(message));
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
