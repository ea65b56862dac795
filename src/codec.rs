//! Frame-level encoder and decoder.
//!
//! The [`Decoder`] is incremental: it consumes a growing [`BytesMut`] and
//! yields one frame at a time, returning `Ok(None)` whenever the buffered
//! bytes cannot complete the next frame. Partially parsed header state is
//! carried across calls, so the byte stream may arrive in arbitrary chunks:
//! byte-by-byte delivery decodes to the same frames as a single read.
//! Whatever follows a decoded frame stays in the buffer for the next call.
//!
//! Both halves are role-aware: the encoder masks every outbound frame when
//! encoding for a client and never masks for a server, and the decoder
//! rejects frames whose mask bit contradicts the peer's role.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    WebSocketError,
};

/// The role an endpoint plays on a connection.
///
/// Clients mask every outbound frame with a fresh random key and require
/// unmasked input; servers do the reverse (RFC 6455 Section 5.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Parsing state of the decoder.
enum ReadState {
    /// The fixed two header bytes are parsed; waiting for the extended
    /// length and masking key.
    Header(Header),
    /// The full header is parsed; waiting for the payload.
    Payload(HeaderAndMask),
}

/// Fields of the first two header bytes.
struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Number of extended-length bytes still to read (0, 2, or 8).
    extra: usize,
    /// The raw 7-bit length code.
    length_code: u8,
    /// Remaining header size: extended length plus masking key.
    header_size: usize,
}

/// Header plus masking key, parsed up to the payload boundary.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Incremental WebSocket frame decoder.
///
/// Enforces the wire invariants that do not need connection state: reserved
/// bits, opcode validity, control-frame constraints, mask direction, and the
/// per-frame read limit.
pub struct Decoder {
    role: Role,
    state: Option<ReadState>,
    max_frame_read: usize,
}

impl Decoder {
    /// Creates a decoder for the given role.
    ///
    /// `max_frame_read` bounds a single frame's payload. The WebSocket
    /// protocol itself imposes no maximum, so this cap is an implementation
    /// safeguard against memory exhaustion; frames announcing a larger
    /// payload fail with [`WebSocketError::FrameTooLarge`].
    pub fn new(role: Role, max_frame_read: usize) -> Self {
        Self {
            role,
            state: None,
            max_frame_read,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;

                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

                    if rsv1 && opcode == OpCode::Continuation {
                        return Err(WebSocketError::Rsv1OnContinuation);
                    }

                    let masked = src[1] & 0b1000_0000 != 0;

                    match self.role {
                        Role::Server if !masked => return Err(WebSocketError::UnmaskedFrame),
                        Role::Client if masked => return Err(WebSocketError::MaskedFrame),
                        _ => {}
                    }

                    let length_code = src[1] & 0x7F;
                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => return Err(WebSocketError::FrameTooLarge),
                        },
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_frame_read {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let payload = src.split_to(header_and_mask.payload_len);

                    let mut frame = Frame::new(header.fin, header.opcode, None, payload);
                    frame.set_mask(header_and_mask.mask);
                    frame.unmask();
                    frame.is_compressed = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder.
///
/// Serializes a [`Frame`] header and payload into the write buffer. For the
/// client role every frame is masked with a fresh random key before the
/// header is formatted; the server role emits payloads verbatim.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.role {
            Role::Client => frame.mask(),
            // A server never masks; drop any key so the mask bit stays clear.
            Role::Server => frame.set_mask(None),
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Combined [`Decoder`] and [`Encoder`] for use with Tokio's framed streams.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec pair for the given role.
    pub fn new(role: Role, max_frame_read: usize) -> Self {
        Self {
            decoder: Decoder::new(role, max_frame_read),
            encoder: Encoder::new(role),
        }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = WebSocketError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const NO_LIMIT: usize = usize::MAX;

    fn encode(role: Role, frame: Frame) -> BytesMut {
        let mut encoder = Encoder::new(role);
        let mut buf = BytesMut::new();
        encoder.encode(frame, &mut buf).expect("encode");
        buf
    }

    fn decode_all(role: Role, buf: &mut BytesMut) -> Vec<Frame> {
        let mut decoder = Decoder::new(role, NO_LIMIT);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(buf).expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn round_trip_client_to_server() {
        for len in [0usize, 1, 125, 126, 127, 65_535, 65_536, 1 << 20] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut wire = encode(Role::Client, Frame::binary(&payload[..]));

            // Wire bytes must carry the mask bit and differ from the payload.
            assert_eq!(wire[1] & 0x80, 0x80, "len={len}");

            let frames = decode_all(Role::Server, &mut wire);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].opcode, OpCode::Binary);
            assert!(frames[0].fin);
            assert_eq!(&frames[0].payload[..], &payload[..], "len={len}");
            assert!(wire.is_empty());
        }
    }

    #[test]
    fn round_trip_server_to_client() {
        let payload = b"from the server";
        let mut wire = encode(Role::Server, Frame::text(&payload[..]));

        assert_eq!(wire[1] & 0x80, 0, "server frames carry no mask bit");
        // Unmasked payload appears verbatim after the two header bytes.
        assert_eq!(&wire[2..], &payload[..]);

        let frames = decode_all(Role::Client, &mut wire);
        assert_eq!(&frames[0].payload[..], &payload[..]);
    }

    #[test]
    fn byte_by_byte_equals_whole_buffer() {
        let payload: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        let wire = encode(Role::Client, Frame::binary(&payload[..]));

        let mut decoder = Decoder::new(Role::Server, NO_LIMIT);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();

        for &byte in wire.iter() {
            buf.extend_from_slice(&[byte]);
            while let Some(frame) = decoder.decode(&mut buf).expect("decode") {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &payload[..]);
    }

    #[test]
    fn remainder_stays_buffered() {
        let mut wire = encode(Role::Server, Frame::text("first"));
        wire.extend_from_slice(&encode(Role::Server, Frame::text("second")));

        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        let first = decoder.decode(&mut wire).expect("decode").expect("frame");
        assert_eq!(&first.payload[..], b"first");

        // The second frame's bytes are still in the buffer.
        let second = decoder.decode(&mut wire).expect("decode").expect("frame");
        assert_eq!(&second.payload[..], b"second");
        assert!(wire.is_empty());
    }

    #[test]
    fn need_more_on_partial_header() {
        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        let mut buf = BytesMut::from(&[0x81u8][..]);
        assert!(decoder.decode(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn server_rejects_unmasked_frame() {
        let mut wire = encode(Role::Server, Frame::text("nope"));
        let mut decoder = Decoder::new(Role::Server, NO_LIMIT);
        assert!(matches!(
            decoder.decode(&mut wire),
            Err(WebSocketError::UnmaskedFrame)
        ));
    }

    #[test]
    fn client_rejects_masked_frame() {
        let mut wire = encode(Role::Client, Frame::text("nope"));
        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        assert!(matches!(
            decoder.decode(&mut wire),
            Err(WebSocketError::MaskedFrame)
        ));
    }

    #[test]
    fn rejects_rsv1_on_continuation() {
        // FIN + RSV1 + opcode 0, unmasked, empty payload.
        let mut buf = BytesMut::from(&[0xC0u8, 0x00][..]);
        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::Rsv1OnContinuation)
        ));
    }

    #[test]
    fn rejects_rsv2_rsv3() {
        let mut buf = BytesMut::from(&[0xA1u8, 0x00][..]);
        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::ReservedBitsNotZero)
        ));
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        // Ping with FIN clear.
        let mut buf = BytesMut::from(&[0x09u8, 0x00][..]);
        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn rejects_oversized_control_frame() {
        // Ping announcing a 126-byte payload via the extended-16 length.
        let mut buf = BytesMut::from(&[0x89u8, 126, 0x00, 126][..]);
        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn rejects_frame_above_read_limit() {
        let wire = encode(Role::Server, Frame::binary(&vec![0u8; 2048][..]));
        let mut buf = BytesMut::from(&wire[..]);
        let mut decoder = Decoder::new(Role::Client, 1024);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn rejects_invalid_opcode() {
        let mut buf = BytesMut::from(&[0x83u8, 0x00][..]);
        let mut decoder = Decoder::new(Role::Client, NO_LIMIT);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::InvalidOpCode(0x3))
        ));
    }

    #[test]
    fn rsv1_survives_decoding() {
        let mut wire = encode(Role::Server, Frame::compressed(true, OpCode::Text, &b"x"[..]));
        let frames = decode_all(Role::Client, &mut wire);
        assert!(frames[0].is_compressed);
    }

    #[test]
    fn two_masked_frames_decode_independently() {
        let mut wire = encode(Role::Client, Frame::text("alpha"));
        wire.extend_from_slice(&encode(Role::Client, Frame::text("beta")));

        let frames = decode_all(Role::Server, &mut wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"alpha");
        assert_eq!(&frames[1].payload[..], b"beta");
    }
}
