//! WebSocket frame codec
//!
//! Wire layout (RFC 6455 section 5.2):
//!
//! ```text
//!  byte 0: FIN (0x80) | opcode (low nibble)
//!  byte 1: MASK (0x80) | 7-bit length
//!          126 -> 16-bit big-endian length follows
//!          127 -> 64-bit big-endian length follows
//!  [4-byte masking key, client-to-server only]
//!  payload (XOR-unmasked with the rolling key when masked)
//! ```
//!
//! Decoding is incremental: [`FrameDecoder`] owns the per-connection partial
//! buffer, and [`FrameDecoder::next`] returns `Ok(None)` without consuming a
//! single byte when the declared frame is not yet complete, so a later call
//! with more bytes reproduces the exact same frame boundary. Multiple
//! complete frames in the buffer are drained one `next()` call at a time.
//!
//! Fragmented data frames (FIN clear) are reassembled transparently; the
//! caller only ever sees complete messages. Control frames may interleave
//! with an in-flight fragmented message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer violated the protocol (bad frame, unparsable envelope)
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Policy violation; used for authentication failures
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Server-side failure while servicing the connection
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Upper bound on a single frame's payload. A peer declaring more than this
/// is disconnected rather than allowed to make us allocate it.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    /// Close, ping and pong; these may not be fragmented
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A complete (reassembled) frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    /// Build a text frame
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// Build a close frame with status code and reason
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self {
            opcode: Opcode::Close,
            payload: payload.freeze(),
        }
    }

    /// Build a pong frame echoing the ping payload
    pub fn pong(payload: Bytes) -> Self {
        Self {
            opcode: Opcode::Pong,
            payload,
        }
    }

    /// Status code of a close frame, if present
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Reason text of a close frame, if present and valid UTF-8
    pub fn close_reason(&self) -> Option<&str> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }
}

/// Encode a server-to-client frame (unmasked, FIN set)
pub fn encode(frame: &Frame) -> Bytes {
    let len = frame.payload.len();
    let mut buf = BytesMut::with_capacity(len + 10);

    buf.put_u8(0x80 | frame.opcode as u8);

    if len <= 125 {
        buf.put_u8(len as u8);
    } else if len <= 65535 {
        buf.put_u8(126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(127);
        buf.put_u64(len as u64);
    }

    buf.put_slice(&frame.payload);
    buf.freeze()
}

/// Encode a client-to-server frame (masked, FIN set)
///
/// Used by test clients and the load-generation side; the server itself
/// always sends unmasked.
pub fn encode_masked(frame: &Frame, key: [u8; 4]) -> Bytes {
    let len = frame.payload.len();
    let mut buf = BytesMut::with_capacity(len + 14);

    buf.put_u8(0x80 | frame.opcode as u8);

    if len <= 125 {
        buf.put_u8(0x80 | len as u8);
    } else if len <= 65535 {
        buf.put_u8(0x80 | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0x80 | 127);
        buf.put_u64(len as u64);
    }

    buf.put_slice(&key);
    for (i, byte) in frame.payload.iter().enumerate() {
        buf.put_u8(byte ^ key[i % 4]);
    }
    buf.freeze()
}

/// One parsed wire frame, before fragment reassembly
struct RawFrame {
    fin: bool,
    opcode: Opcode,
    payload: BytesMut,
}

/// Incremental frame decoder owning a connection's partial-read buffer
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Open fragmented message: original opcode + accumulated payload
    fragment: Option<(Opcode, BytesMut)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes to the partial buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not-yet-consumed bytes
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete message, reassembling fragments.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete frame; call
    /// [`extend`](Self::extend) with more bytes and retry.
    pub fn next(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let raw = match self.parse_one()? {
                Some(raw) => raw,
                None => return Ok(None),
            };

            match raw.opcode {
                Opcode::Continuation => {
                    let (opcode, mut acc) = self
                        .fragment
                        .take()
                        .ok_or(ProtocolError::UnexpectedContinuation)?;
                    acc.extend_from_slice(&raw.payload);
                    if raw.fin {
                        return Ok(Some(Frame {
                            opcode,
                            payload: acc.freeze(),
                        }));
                    }
                    self.fragment = Some((opcode, acc));
                }
                opcode if opcode.is_control() => {
                    if !raw.fin {
                        return Err(ProtocolError::FragmentedControl);
                    }
                    return Ok(Some(Frame {
                        opcode,
                        payload: raw.payload.freeze(),
                    }));
                }
                opcode => {
                    if self.fragment.is_some() {
                        return Err(ProtocolError::FragmentInProgress);
                    }
                    if raw.fin {
                        return Ok(Some(Frame {
                            opcode,
                            payload: raw.payload.freeze(),
                        }));
                    }
                    self.fragment = Some((opcode, raw.payload));
                }
            }
        }
    }

    /// Parse a single wire frame, consuming bytes only when it is complete
    fn parse_one(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        let buf = &self.buf[..];
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
        let masked = buf[1] & 0x80 != 0;

        let mut len = (buf[1] & 0x7F) as u64;
        let mut offset = 2usize;
        if len == 126 {
            if buf.len() < 4 {
                return Ok(None);
            }
            len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            offset = 4;
        } else if len == 127 {
            if buf.len() < 10 {
                return Ok(None);
            }
            len = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            offset = 10;
        }

        if len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(len));
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = offset + mask_len + len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mut key = [0u8; 4];
        if masked {
            key.copy_from_slice(&buf[offset..offset + 4]);
        }

        self.buf.advance(offset + mask_len);
        let mut payload = self.buf.split_to(len as usize);
        if masked {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(RawFrame {
            fin,
            opcode,
            payload,
        }))
    }
}
