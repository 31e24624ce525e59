//! WebSocket frame codec (RFC 6455 §5).
//!
//! Frame layout:
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| payload len |   extended payload length     |
//! |I|S|S|S|  (4)  |A|     (7)     |          (16 or 64)           |
//! |N|V|V|V|       |S|             |  (if payload len == 126/127)  |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |   masking key (0 or 4 bytes)  |          payload ...          |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Server-to-client frames are never masked.  Client-to-server frames are
//! normally masked; the decoder unmasks when the mask bit is set and accepts
//! unmasked frames as-is.
//!
//! # Length encoding
//!
//! | Payload size        | 7-bit field | Extra bytes |
//! |---------------------|-------------|-------------|
//! | 0 – 125             | the size    | 0           |
//! | 126 – 65 535        | 126         | 2 (u16 BE)  |
//! | 65 536 and above    | 127         | 8 (u64 BE)  |

use bytes::{Buf, BytesMut};

use super::message::{Message, OpCode};
use super::FrameError;

/// Close frame sent by the server: FIN + close, 2-byte payload, status 1000.
pub const CLOSE_FRAME: [u8; 4] = [0x88, 0x02, 0x03, 0xE8];

/// Zero-length ping sent by the heartbeat.
pub const PING_FRAME: [u8; 2] = [0x89, 0x00];

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const RESERVE_CAP: usize = 64 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Encodes one unmasked frame with the smallest possible length field.
///
/// # Examples
///
/// ```rust
/// use netman_core::protocol::websocket::encode_frame;
/// use netman_core::protocol::OpCode;
///
/// assert_eq!(encode_frame(true, OpCode::Text, b"hi"), [0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let first_byte = if fin { 0x80 } else { 0x00 } | opcode as u8;
    let len = payload.len();

    let mut buf = Vec::with_capacity(header_len(len) + len);
    buf.push(first_byte);
    if len <= 125 {
        buf.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.push(126);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Size of an unmasked frame header for a payload of `len` bytes.
pub fn header_len(len: usize) -> usize {
    if len <= 125 {
        2
    } else if len <= usize::from(u16::MAX) {
        4
    } else {
        10
    }
}

pub fn text_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(true, OpCode::Text, payload)
}

pub fn binary_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(true, OpCode::Binary, payload)
}

/// Pong reply echoing the ping's payload (first byte `0x8A`).
pub fn pong_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(true, OpCode::Pong, payload)
}

/// XORs `payload` in place with the 4-byte masking key.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Takes one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` (buffer untouched) until the whole frame is present.
/// `max_payload` of `0` means unlimited.
///
/// # Errors
///
/// - [`FrameError::Malformed`] for reserved bits, unknown opcodes, oversized
///   or fragmented control frames and 64-bit lengths with the top bit set.
/// - [`FrameError::BodyLenExceedLimit`] when the declared payload is larger
///   than `max_payload`.
pub fn decode_frame(buf: &mut BytesMut, max_payload: u32) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & 0x70 != 0 {
        return Err(FrameError::Malformed(format!(
            "reserved bits set: 0x{:02X}",
            b0 & 0x70
        )));
    }

    let fin = b0 & 0x80 != 0;
    let opcode = OpCode::try_from(b0 & 0x0F)
        .map_err(|code| FrameError::Malformed(format!("unknown opcode 0x{code:X}")))?;
    let masked = b1 & 0x80 != 0;

    let (payload_len, mut offset) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(FrameError::Malformed(
                    "64-bit payload length has the top bit set".to_string(),
                ));
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::Malformed(format!(
                "fragmented control frame {opcode:?}"
            )));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::Malformed(format!(
                "control frame {opcode:?} carries {payload_len} bytes"
            )));
        }
    }

    if max_payload > 0 && payload_len > u64::from(max_payload) {
        return Err(FrameError::BodyLenExceedLimit {
            declared: payload_len,
            limit: max_payload,
        });
    }

    let payload_len = usize::try_from(payload_len)
        .map_err(|_| FrameError::Malformed(format!("payload length {payload_len} too large")))?;
    let mask_len = if masked { 4 } else { 0 };
    let total = offset + mask_len + payload_len;
    if buf.len() < total {
        buf.reserve((total - buf.len()).min(RESERVE_CAP));
        return Ok(None);
    }

    let mask_key = if masked {
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    buf.advance(offset);
    let mut payload = buf.split_to(payload_len).to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload,
    }))
}

// ── Fragment reassembly ───────────────────────────────────────────────────────

/// Joins a text/binary frame and its continuation frames into one message.
///
/// Control frames never go through the reassembler; the caller handles them
/// as they arrive, even in the middle of a fragmented message.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: Option<(OpCode, Vec<u8>)>,
    max_len: u32,
}

impl Reassembler {
    /// `max_len` caps the size of the reassembled message (`0` = unlimited).
    pub fn new(max_len: u32) -> Self {
        Self {
            partial: None,
            max_len,
        }
    }

    /// True while a fragmented message is waiting for its final frame.
    pub fn is_assembling(&self) -> bool {
        self.partial.is_some()
    }

    /// Feeds one data frame; returns the message once its final frame lands.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] for a continuation with no opening
    /// frame or a new data frame while one is still open, and
    /// [`FrameError::BodyLenExceedLimit`] when the joined payload grows past
    /// the limit.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        match (frame.opcode, self.partial.take()) {
            (OpCode::Continuation, None) => Err(FrameError::Malformed(
                "continuation frame without an opening frame".to_string(),
            )),
            (OpCode::Continuation, Some((opcode, mut data))) => {
                data.extend_from_slice(&frame.payload);
                self.check_len(data.len())?;
                if frame.fin {
                    Ok(Some(Message::websocket(opcode, data)))
                } else {
                    self.partial = Some((opcode, data));
                    Ok(None)
                }
            }
            (opcode, None) => {
                if frame.fin {
                    Ok(Some(Message::websocket(opcode, frame.payload)))
                } else {
                    self.partial = Some((opcode, frame.payload));
                    Ok(None)
                }
            }
            (opcode, Some(_)) => Err(FrameError::Malformed(format!(
                "{opcode:?} frame while a fragmented message is open"
            ))),
        }
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if self.max_len > 0 && len as u64 > u64::from(self.max_len) {
            return Err(FrameError::BodyLenExceedLimit {
                declared: len as u64,
                limit: self.max_len,
            });
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a masked client frame the way a browser would.
    fn client_frame(fin: bool, opcode: OpCode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut frame = encode_frame(fin, opcode, payload);
        let header = header_len(payload.len());
        frame[1] |= 0x80;
        let mut masked = frame.split_off(header);
        apply_mask(&mut masked, key);
        frame.extend_from_slice(&key);
        frame.extend_from_slice(&masked);
        frame
    }

    fn decode_all(bytes: &[u8]) -> Frame {
        let mut buf = BytesMut::from(bytes);
        let frame = decode_frame(&mut buf, 0)
            .expect("decode must succeed")
            .expect("frame must be complete");
        assert!(buf.is_empty(), "all bytes must be consumed");
        frame
    }

    // ── Encoding ──────────────────────────────────────────────────────────────

    #[test]
    fn test_length_field_width_is_minimal_at_boundaries() {
        let cases = [
            (0usize, 2usize, 0u8),
            (1, 2, 1),
            (125, 2, 125),
            (126, 4, 126),
            (65_535, 4, 126),
            (65_536, 10, 127),
        ];
        for (len, header, marker) in cases {
            let payload = vec![0xAB; len];
            let frame = encode_frame(true, OpCode::Binary, &payload);
            assert_eq!(frame.len(), header + len, "frame size for {len}");
            assert_eq!(frame[1], marker, "length marker for {len}");
            assert_eq!(frame[1] & 0x80, 0, "server frames are never masked");
        }
    }

    #[test]
    fn test_boundary_lengths_round_trip_payload_and_opcode() {
        for len in [0usize, 1, 125, 126, 65_535, 65_536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for opcode in [OpCode::Text, OpCode::Binary] {
                let frame = decode_all(&encode_frame(true, opcode, &payload));
                assert!(frame.fin);
                assert_eq!(frame.opcode, opcode);
                assert_eq!(frame.payload, payload, "payload for {len}");
            }
        }
    }

    #[test]
    fn test_extended_lengths_are_big_endian() {
        let frame = encode_frame(true, OpCode::Binary, &vec![0; 300]);
        assert_eq!(&frame[2..4], &300u16.to_be_bytes());

        let frame = encode_frame(true, OpCode::Binary, &vec![0; 70_000]);
        assert_eq!(&frame[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn test_pong_frame_echoes_payload_under_0x8a() {
        let frame = pong_frame(b"abc");
        assert_eq!(frame, [0x8A, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_close_and_ping_constants_decode() {
        let close = decode_all(&CLOSE_FRAME);
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(close.payload, 1000u16.to_be_bytes());

        let ping = decode_all(&PING_FRAME);
        assert_eq!(ping.opcode, OpCode::Ping);
        assert!(ping.payload.is_empty());
    }

    // ── Decoding ──────────────────────────────────────────────────────────────

    #[test]
    fn test_decode_masked_client_text_frame() {
        // Arrange
        let bytes = client_frame(true, OpCode::Text, b"Hello", [0x37, 0xFA, 0x21, 0x3D]);

        // Act
        let frame = decode_all(&bytes);

        // Assert
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_decode_rfc_sample_masked_hello() {
        // RFC 6455 §5.7: a single-frame masked text message containing "Hello".
        let bytes = [
            0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58,
        ];
        let frame = decode_all(&bytes);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_decode_waits_for_every_header_stage() {
        let bytes = client_frame(true, OpCode::Binary, &vec![7u8; 200], [1, 2, 3, 4]);
        let mut buf = BytesMut::new();
        for (i, byte) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = decode_frame(&mut buf, 0).unwrap();
            if i + 1 < bytes.len() {
                assert!(result.is_none(), "frame completed early at byte {i}");
            } else {
                assert_eq!(result.unwrap().payload, vec![7u8; 200]);
            }
        }
    }

    #[test]
    fn test_decode_rejects_reserved_bits() {
        let mut buf = BytesMut::from(&[0xC1, 0x00][..]);
        assert!(matches!(decode_frame(&mut buf, 0), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(decode_frame(&mut buf, 0), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_fragmented_control_frame() {
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(matches!(decode_frame(&mut buf, 0), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_oversized_control_frame() {
        let mut buf = BytesMut::from(&[0x89, 0x7E, 0x00, 0x7E][..]);
        assert!(matches!(decode_frame(&mut buf, 0), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_payload_above_limit() {
        let mut buf = BytesMut::from(&encode_frame(true, OpCode::Binary, &[0u8; 20])[..]);
        assert_eq!(
            decode_frame(&mut buf, 10),
            Err(FrameError::BodyLenExceedLimit {
                declared: 20,
                limit: 10
            })
        );
    }

    #[test]
    fn test_decode_rejects_top_bit_in_64_bit_length() {
        let mut bytes = vec![0x82, 0x7F];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(decode_frame(&mut buf, 0), Err(FrameError::Malformed(_))));
    }

    // ── Reassembly ────────────────────────────────────────────────────────────

    #[test]
    fn test_reassembler_joins_fragments_with_opening_opcode() {
        let mut reassembler = Reassembler::new(0);
        let first = Frame {
            fin: false,
            opcode: OpCode::Text,
            payload: b"Hel".to_vec(),
        };
        let last = Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: b"lo".to_vec(),
        };

        assert_eq!(reassembler.push(first), Ok(None));
        assert!(reassembler.is_assembling());
        let message = reassembler.push(last).unwrap().unwrap();

        assert!(message.is_text());
        assert_eq!(message.bytes(), b"Hello");
        assert!(!reassembler.is_assembling());
    }

    #[test]
    fn test_reassembler_rejects_orphan_continuation() {
        let mut reassembler = Reassembler::new(0);
        let orphan = Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: vec![],
        };
        assert!(matches!(reassembler.push(orphan), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_reassembler_rejects_new_message_while_open() {
        let mut reassembler = Reassembler::new(0);
        let open = Frame {
            fin: false,
            opcode: OpCode::Binary,
            payload: vec![1],
        };
        let interloper = Frame {
            fin: true,
            opcode: OpCode::Text,
            payload: vec![2],
        };
        reassembler.push(open).unwrap();
        assert!(matches!(reassembler.push(interloper), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_reassembler_enforces_joined_length_limit() {
        let mut reassembler = Reassembler::new(4);
        reassembler
            .push(Frame {
                fin: false,
                opcode: OpCode::Binary,
                payload: vec![0; 3],
            })
            .unwrap();
        let result = reassembler.push(Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: vec![0; 3],
        });
        assert_eq!(
            result,
            Err(FrameError::BodyLenExceedLimit {
                declared: 6,
                limit: 4
            })
        );
    }
}
