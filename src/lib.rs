//! # webtide
//!
//! A WebSocket protocol engine implementing [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)
//! with optional per-message compression per [RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692).
//!
//! The crate provides both client and server endpoints over plaintext TCP
//! (`ws://`) and TLS (`wss://`), built around three layers:
//!
//! - [`codec`]: byte-accurate frame encoding and decoding, incremental over
//!   arbitrary TCP chunk boundaries, with masking enforced by role.
//! - [`connection`]: the connection state machine: lifecycle
//!   `Connecting → Open → Closing → Closed`, control-frame protocol,
//!   fragmented-message reassembly, and per-message deflate.
//! - [`client`] / [`server`]: the HTTP upgrade handshake, TLS, and
//!   connection tracking.
//!
//! # Connecting
//!
//! ```no_run
//! use webtide::{Client, Event, Message};
//!
//! #[tokio::main]
//! async fn main() -> webtide::Result<()> {
//!     let mut ws = Client::connect("ws://localhost:7357/".parse()?).await?;
//!
//!     ws.send(Message::text("ping")).await?;
//!     while let Some(event) = ws.next_event().await {
//!         match event {
//!             Event::Message(payload) => println!("got {} bytes", payload.len()),
//!             Event::Close(_) => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod close;
pub mod codec;
mod compression;
pub mod connection;
pub mod frame;
pub mod handshake;
mod mask;
pub mod server;
mod stream;

pub use client::{Client, ClientBuilder, ClientOptions};
pub use codec::Role;
pub use compression::{CompressionLevel, DeflateOffer};
pub use connection::{Connection, Event, Message, ReadyState};
pub use frame::{Frame, OpCode};
pub use server::{Server, ServerHandle, ServerOptions, TlsIdentity};
pub use stream::MaybeTlsStream;

use thiserror::Error;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors that can occur while establishing or driving a WebSocket connection.
///
/// Protocol violations carry the user-visible message mandated by the
/// protocol (for example a server that receives an unmasked frame closes the
/// connection with the reason `"unmasked frame"`, the `Display` text of
/// [`WebSocketError::UnmaskedFrame`]).
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The connect URL did not use the `ws` or `wss` scheme.
    #[error("URL protocol must be ws or wss")]
    InvalidUrl,

    /// A secure server was configured without a usable key/cert pair.
    #[error("invalid key and cert options")]
    InvalidOptions,

    /// The server answered the upgrade request with a status other than
    /// `101 Switching Protocols`.
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The `Upgrade` header of the handshake response was missing or not
    /// `websocket`.
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The `Sec-WebSocket-Accept` digest returned by the server did not match
    /// the key we sent.
    #[error("invalid accept key")]
    InvalidAcceptKey,

    /// The client upgrade request lacked the mandatory `Sec-WebSocket-Key`
    /// header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The client requested a protocol version other than 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebSocketVersion,

    /// A server received a frame without the mask bit. RFC 6455 requires all
    /// client-to-server frames to be masked.
    #[error("unmasked frame")]
    UnmaskedFrame,

    /// A client received a masked frame. RFC 6455 forbids server-to-client
    /// masking.
    #[error("masked frame")]
    MaskedFrame,

    /// RSV1 marks the start of a compressed message and is only valid on the
    /// first frame; continuation frames must leave it clear.
    #[error("RSV1 must not be set for continuation frames")]
    Rsv1OnContinuation,

    /// RSV2 or RSV3 was set; no extension in this implementation uses them.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The 4-bit opcode was not one of the values RFC 6455 defines.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame (close, ping, pong) arrived with the FIN bit clear.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than the 125 payload bytes RFC 6455
    /// allows.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A continuation frame arrived with no message in progress, or a new
    /// data frame started while a fragmented message was still incomplete.
    #[error("invalid fragment")]
    InvalidFragment,

    /// A close frame carried a one-byte payload; close payloads are either
    /// empty or start with a two-byte status code.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code outside the ranges RFC 6455
    /// permits on the wire.
    #[error("invalid close code")]
    InvalidCloseCode,

    /// An inbound frame or reassembled message exceeded the configured read
    /// limit.
    #[error("frame too large")]
    FrameTooLarge,

    /// A compressed frame arrived on a connection that did not negotiate
    /// `permessage-deflate`.
    #[error("received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// Deflate or inflate failed. Inbound decompression failures are
    /// surfaced as an [`Event::Error`](connection::Event::Error) and the
    /// connection keeps decoding subsequent frames.
    #[error("compression error: {0}")]
    Compression(#[source] std::io::Error),

    /// The operation was attempted after the connection reached the
    /// `Closed` state.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Wraps URL parsing failures for `ws`/`wss` URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps transport-level I/O errors.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Whether the error is a protocol violation that obliges us to send a
    /// CLOSE frame before tearing the connection down.
    pub(crate) fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnmaskedFrame
                | Self::MaskedFrame
                | Self::Rsv1OnContinuation
                | Self::ReservedBitsNotZero
                | Self::InvalidOpCode(_)
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::InvalidFragment
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode
                | Self::FrameTooLarge
                | Self::CompressionNotSupported
        )
    }
}
