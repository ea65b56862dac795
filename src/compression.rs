//! Per-message deflate (RFC 7692).
//!
//! Compression is applied per *message*: the starting frame of a compressed
//! message carries RSV1, its continuation frames do not. On the wire the
//! deflate stream is truncated by removing a trailing `0x00 0x00 0xFF 0xFF`
//! empty-block marker; the receiver appends that marker back before
//! inflating (RFC 7692 Section 7.2).
//!
//! Each message is an independent compression operation: the deflate context
//! is reset between messages, so no sliding window is shared across them.
//! Window-bits parameters are still parsed and echoed during negotiation,
//! but prior context is discarded.

use std::io;

use bytes::{BufMut, BytesMut};
use flate2::{CompressError, DecompressError, Status};

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

/// Compression level, re-exported from `flate2`.
pub type CompressionLevel = flate2::Compression;

/// The empty deflate block every `Sync`-flushed stream ends with. Stripped
/// before transmission and re-appended before inflation.
pub(crate) const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Parsed `permessage-deflate` offer from a `Sec-WebSocket-Extensions`
/// header.
///
/// The client advertises `permessage-deflate; client_max_window_bits`; the
/// server answers with a bare `permessage-deflate`. Window-bits and
/// context-takeover parameters are recognized and recorded, but compression
/// runs per message regardless, so they do not change behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateOffer {
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl DeflateOffer {
    /// The offer a client puts in its upgrade request.
    pub fn client_default() -> Self {
        Self {
            // A bare parameter, without a value.
            client_max_window_bits: Some(0),
            ..Self::default()
        }
    }

    /// The acceptance a server puts in its 101 response.
    pub fn server_accept() -> Self {
        Self::default()
    }

    fn parse(input: &str) -> Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut this = Self::default();
        let (remaining, _) = tag(PERMESSAGE_DEFLATE)(input)?;
        this.parse_params(remaining)?;
        Ok(this)
    }

    /// Walks the `; key[=value]` parameter list after the extension name.
    /// Unknown keys are ignored.
    fn parse_params<'a>(
        &mut self,
        mut input: &'a str,
    ) -> Result<(), nom::Err<nom::error::Error<&'a str>>> {
        while !input.is_empty() {
            let (remaining, (key, value)) = Self::parse_param(input)?;
            match key {
                "client_no_context_takeover" => self.client_no_context_takeover = true,
                "server_no_context_takeover" => self.server_no_context_takeover = true,
                "server_max_window_bits" => {
                    self.server_max_window_bits =
                        Some(value.and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                "client_max_window_bits" => {
                    self.client_max_window_bits =
                        Some(value.and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                _ => {}
            }

            input = remaining;
        }

        Ok(())
    }

    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            tag(";"),
            preceded(
                space0,
                pair(
                    take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                    opt(preceded(tag("="), digit1)),
                ),
            ),
        )(input)
    }
}

impl std::fmt::Display for DeflateOffer {
    /// Formats the offer for a `Sec-WebSocket-Extensions` header value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", PERMESSAGE_DEFLATE)?;

        if let Some(bits) = self.server_max_window_bits {
            if (9..16).contains(&bits) {
                write!(f, "; server_max_window_bits={}", bits)?;
            } else {
                write!(f, "; server_max_window_bits")?;
            }
        }
        if let Some(bits) = self.client_max_window_bits {
            if (9..16).contains(&bits) {
                write!(f, "; client_max_window_bits={}", bits)?;
            } else {
                write!(f, "; client_max_window_bits")?;
            }
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }

        Ok(())
    }
}

impl std::str::FromStr for DeflateOffer {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input.trim()).map_err(|err| err.to_string())
    }
}

/// Compresses one message at a time with raw deflate.
///
/// [`Compressor::compress`] resets the dictionary, deflates the input,
/// `Sync`-flushes, and strips the trailing empty-block marker when present.
pub struct Compressor {
    output: BytesMut,
    compress: flate2::Compress,
}

impl Compressor {
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            compress: flate2::Compress::new(level, false),
        }
    }

    /// Compresses a whole message, returning the wire payload with the
    /// `0x00 0x00 0xFF 0xFF` tail removed when the deflate output ends in
    /// the empty block.
    pub fn compress(&mut self, mut input: &[u8]) -> io::Result<BytesMut> {
        self.compress.reset();

        while !input.is_empty() {
            let consumed = self.write(input)?;
            input = &input[consumed..];
        }
        self.flush()
    }

    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        let dst = chunk(output);

        let before_out = compressor.total_out();
        let before_in = compressor.total_in();

        let status = compressor.compress(input, dst, flate2::FlushCompress::None);

        let written = (compressor.total_out() - before_out) as usize;
        let consumed = (compressor.total_in() - before_in) as usize;

        unsafe { output.advance_mut(written) };

        match status {
            Ok(Status::Ok) => Ok(consumed),
            Ok(Status::StreamEnd | Status::BufError) | Err(..) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "corrupt deflate stream",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<BytesMut> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        let dst = chunk(output);
        let before_out = compressor.total_out();

        compressor
            .compress(&[], dst, flate2::FlushCompress::Sync)
            .map_err(deflate_error)?;

        let written = (compressor.total_out() - before_out) as usize;
        unsafe { output.advance_mut(written) };

        loop {
            let dst = chunk(output);

            let before_out = compressor.total_out();
            compressor
                .compress(&[], dst, flate2::FlushCompress::None)
                .map_err(deflate_error)?;

            if before_out == compressor.total_out() {
                if output.ends_with(&DEFLATE_TAIL) {
                    output.truncate(output.len() - DEFLATE_TAIL.len());
                }

                break Ok(output.split());
            }

            let written = (compressor.total_out() - before_out) as usize;
            unsafe { output.advance_mut(written) };
        }
    }
}

/// Decompresses one message at a time with raw inflate.
///
/// [`Decompressor::decompress`] resets the dictionary, appends the
/// `0x00 0x00 0xFF 0xFF` tail the sender stripped, and inflates.
pub struct Decompressor {
    output: BytesMut,
    decompress: flate2::Decompress,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            decompress: flate2::Decompress::new(false),
        }
    }
}

impl Decompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inflates a whole message payload as received from the wire.
    pub fn decompress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        self.decompress.reset(false);

        self.write(input)?;
        self.write(&DEFLATE_TAIL)?;
        self.flush()
    }

    fn write(&mut self, mut input: &[u8]) -> io::Result<()> {
        let output = &mut self.output;
        let decompressor = &mut self.decompress;

        while !input.is_empty() {
            let dst = chunk(output);

            let before_out = decompressor.total_out();
            let before_in = decompressor.total_in();

            let status = decompressor.decompress(input, dst, flate2::FlushDecompress::None);

            let read = (decompressor.total_out() - before_out) as usize;
            let consumed = (decompressor.total_in() - before_in) as usize;

            unsafe { output.advance_mut(read) };

            input = &input[consumed..];

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(..) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "corrupt deflate stream",
                    ))
                }
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> io::Result<BytesMut> {
        let output = &mut self.output;
        let decompressor = &mut self.decompress;

        let dst = chunk(output);
        let before_out = decompressor.total_out();

        decompressor
            .decompress(&[], dst, flate2::FlushDecompress::Sync)
            .map_err(inflate_error)?;

        let written = (decompressor.total_out() - before_out) as usize;
        unsafe { output.advance_mut(written) };

        loop {
            let dst = chunk(output);

            let before_out = decompressor.total_out();
            decompressor
                .decompress(&[], dst, flate2::FlushDecompress::None)
                .map_err(inflate_error)?;

            if before_out == decompressor.total_out() {
                break Ok(output.split());
            }

            let written = (decompressor.total_out() - before_out) as usize;
            unsafe { output.advance_mut(written) };
        }
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("compression error: {}", err))
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("decompression error: {}", err),
    )
}

/// Returns the buffer's spare capacity as an initialized-byte slice,
/// reserving room first when the buffer is full.
///
/// # Safety
/// Treating the uninitialized spare capacity as `&mut [u8]` is sound here:
/// the bytes are written by flate2 before `advance_mut` exposes them.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // chunk_mut would reserve only 64 bytes
        output.reserve(1024);
    }

    let uninit = output.spare_capacity_mut();
    unsafe { &mut *(uninit as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_offer_with_parameters() {
        let offer = DeflateOffer::from_str(
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=12; client_max_window_bits",
        )
        .unwrap();
        assert!(offer.client_no_context_takeover);
        assert!(!offer.server_no_context_takeover);
        assert_eq!(offer.server_max_window_bits, Some(12));
        assert_eq!(offer.client_max_window_bits, Some(0));
    }

    #[test]
    fn parse_offer_rejects_garbage() {
        assert!(DeflateOffer::from_str("foo, bar; baz=1").is_err());
        assert!(DeflateOffer::from_str(
            "permessage-deflate; client_no_context_takeover server_max_window_bits=7"
        )
        .is_err());
    }

    #[test]
    fn client_offer_formats_bare_window_bits() {
        let offer = DeflateOffer::client_default();
        assert_eq!(
            offer.to_string(),
            "permessage-deflate; client_max_window_bits"
        );
    }

    #[test]
    fn server_accept_is_bare() {
        assert_eq!(DeflateOffer::server_accept().to_string(), "permessage-deflate");
    }

    #[test]
    fn compress_decompress_round_trip() {
        let mut compressor = Compressor::new(CompressionLevel::default());
        let mut decompressor = Decompressor::new();

        let data = b"a moderately repetitive payload payload payload payload";
        let compressed = compressor.compress(data).expect("compress");
        assert!(!compressed.is_empty());

        let restored = decompressor.decompress(&compressed).expect("decompress");
        assert_eq!(&restored[..], &data[..]);
    }

    #[test]
    fn compressed_output_has_tail_stripped() {
        let mut compressor = Compressor::new(CompressionLevel::default());
        let compressed = compressor.compress(b"tail check").expect("compress");
        assert!(!compressed.ends_with(&DEFLATE_TAIL));
    }

    #[test]
    fn messages_are_independent() {
        // With the context reset per message, compressing the same input
        // twice yields identical bytes, and each output inflates on a fresh
        // decompressor.
        let data = vec![b'/'; 4096];

        let mut compressor = Compressor::new(CompressionLevel::default());
        let first = compressor.compress(&data).expect("compress");
        let second = compressor.compress(&data).expect("compress");
        assert_eq!(first, second);

        let mut decompressor = Decompressor::new();
        assert_eq!(&decompressor.decompress(&first).expect("inflate")[..], &data[..]);
        assert_eq!(&decompressor.decompress(&second).expect("inflate")[..], &data[..]);
    }

    #[test]
    fn large_payload_round_trip() {
        let data = vec![b'/'; 3 * 1024 * 1024];

        let mut compressor = Compressor::new(CompressionLevel::default());
        let compressed = compressor.compress(&data).expect("compress");
        assert!(compressed.len() < data.len());

        let mut decompressor = Decompressor::new();
        let restored = decompressor.decompress(&compressed).expect("decompress");
        assert_eq!(restored.len(), data.len());
        assert_eq!(&restored[..], &data[..]);
    }

    #[test]
    fn inflate_rejects_garbage() {
        let mut decompressor = Decompressor::new();
        assert!(decompressor.decompress(&[0xFF, 0xFF, 0x12, 0x34]).is_err());
    }
}
