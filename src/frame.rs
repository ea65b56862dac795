//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic unit of the wire protocol: a small header followed
//! by a payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Data frames (`Text`, `Binary`, `Continuation`) carry application payload;
//! control frames (`Close`, `Ping`, `Pong`) manage the connection and must be
//! final and at most 125 payload bytes.

use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// Maximum number of bytes a control-frame payload may carry
/// (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Size of the scratch buffer that can hold any frame header: 2 fixed bytes,
/// up to 8 extended-length bytes, and an optional 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// WebSocket operation code, determining the meaning and handling of a frame.
///
/// Numeric values per
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// Continuation = 0x0, Text = 0x1, Binary = 0x2, Close = 0x8, Ping = 0x9,
/// Pong = 0xA. The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping`, and `Pong`.
    ///
    /// Control frames cannot be fragmented, may carry at most 125 payload
    /// bytes, and are handled ahead of data frames by the connection.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A decoded or to-be-encoded WebSocket frame.
///
/// # Fields
/// - `fin`: final-fragment flag; when `true` this frame completes a message.
/// - `opcode`: frame type.
/// - `is_compressed`: RSV1, the permessage-deflate marker; set only on the
///   first frame of a compressed message.
/// - `mask`: optional 4-byte XOR masking key. Client-to-server frames are
///   masked by the encoder; decoded frames have already been unmasked.
/// - `payload`: the payload bytes.
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// RSV1: whether the payload is (the start of) a compressed message.
    pub(crate) is_compressed: bool,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame with the given metadata and payload.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            is_compressed: false,
        }
    }

    /// Creates a frame whose payload is (the start of) a compressed message,
    /// i.e. with RSV1 set.
    pub(crate) fn compressed(
        fin: bool,
        opcode: OpCode,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
            is_compressed: true,
        }
    }

    /// Creates a final text frame. The payload is not validated as UTF-8;
    /// callers provide `&str`-derived bytes when that matters.
    pub fn text(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a final continuation frame. Combine with [`Frame::with_fin`]
    /// for the middle fragments of a message.
    pub fn continuation(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame carrying a status code and a reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);

        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with a raw payload, without enforcing the
    /// code-plus-reason structure. Used to echo a peer's close payload.
    pub fn close_raw(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Sets the FIN bit and returns the frame, for building fragments.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Extracts the close code from a close frame's payload.
    ///
    /// Returns `None` when the payload is too short to carry the two-byte
    /// status code.
    pub fn close_code(&self) -> Option<CloseCode> {
        if self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        Some(CloseCode::from(code))
    }

    /// Extracts the reason bytes from a close frame's payload: everything
    /// after the status code, or the empty slice when there is none.
    pub fn close_reason(&self) -> &[u8] {
        if self.payload.len() < 2 {
            &[]
        } else {
            &self.payload[2..]
        }
    }

    /// Masks the payload in place. Generates a fresh random key when none is
    /// set; the key the payload was masked with is kept for the header.
    pub(crate) fn mask(&mut self) {
        let mask = self.mask.unwrap_or_else(rand::random);
        crate::mask::apply_mask(&mut self.payload, mask);
        self.mask = Some(mask);
    }

    /// Reverses masking using the stored key and clears it.
    pub(crate) fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Installs a masking key without touching the payload. The decoder uses
    /// this after reading the key from the wire.
    pub(crate) fn set_mask(&mut self, mask: Option<[u8; 4]>) {
        self.mask = mask;
    }

    /// Writes the frame header into `head` and returns its length in bytes
    /// (2, 4, or 10, plus 4 when masked).
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        let rsv1 = u8::from(self.is_compressed);
        head[0] = (self.fin as u8) << 7 | rsv1 << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}
