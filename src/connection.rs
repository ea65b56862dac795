//! The connection state machine.
//!
//! A [`Connection`] drives the lifecycle `Connecting → Open → Closing →
//! Closed`, routes control frames, reassembles fragmented messages, applies
//! per-message deflate, and surfaces everything that happens as [`Event`]s.
//!
//! Events are pull-based: [`Connection::next_event`] (or the
//! [`futures::Stream`] impl) yields them in the order they occurred on the
//! wire. [`Event::Close`] is delivered exactly once per connection; after it
//! the stream ends. A fatal error produces [`Event::Error`] followed by
//! [`Event::Close`].
//!
//! All connection state is owned by the `Connection` and touched only
//! through `&mut self`, so a connection is driven by one task at a time;
//! callers that share a connection across tasks put it behind their own
//! mutex or a channel-fed writer task.

use std::{
    collections::VecDeque,
    future::poll_fn,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    close::CloseCode,
    codec::{Codec, Role},
    compression::{CompressionLevel, Compressor, Decompressor},
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    Result, WebSocketError,
};

/// Default threshold above which outbound messages are fragmented, in bytes.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4096;

/// Default transport read-buffer size, in bytes.
pub const DEFAULT_SOCKET_BUFFER_LENGTH: usize = 102_400;

/// Default cap on a single inbound frame's payload, 16 MiB.
///
/// RFC 6455 allows frames of up to 2^63 bytes; accepting that verbatim is a
/// memory-exhaustion hazard, so inbound frames above this bound fail with
/// [`WebSocketError::FrameTooLarge`].
pub const DEFAULT_MAX_FRAME_READ: usize = 16 * 1024 * 1024;

/// Default cap on a reassembled inbound message, 64 MiB.
pub const DEFAULT_MAX_MESSAGE_READ: usize = 64 * 1024 * 1024;

/// Connection parameters fixed at handshake time.
#[derive(Clone)]
pub(crate) struct Config {
    /// Whether `permessage-deflate` was negotiated.
    pub(crate) deflate: bool,
    pub(crate) compression_level: CompressionLevel,
    /// Outbound fragmentation threshold.
    pub(crate) max_message_length: usize,
    pub(crate) socket_buffer_length: usize,
    pub(crate) max_frame_read: usize,
    pub(crate) max_message_read: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deflate: false,
            compression_level: CompressionLevel::default(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            socket_buffer_length: DEFAULT_SOCKET_BUFFER_LENGTH,
            max_frame_read: DEFAULT_MAX_FRAME_READ,
            max_message_read: DEFAULT_MAX_MESSAGE_READ,
        }
    }
}

/// Connection lifecycle state, with the wire-level numeric codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// An outbound application message.
#[derive(Debug, Clone)]
pub enum Message {
    /// Sent as a TEXT frame; the string's UTF-8 bytes are the payload.
    Text(String),
    /// Sent as a BINARY frame.
    Binary(Bytes),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::Binary(payload.into())
    }

    fn into_parts(self) -> (OpCode, Bytes) {
        match self {
            Self::Text(text) => (OpCode::Text, Bytes::from(text.into_bytes())),
            Self::Binary(payload) => (OpCode::Binary, payload),
        }
    }
}

/// Something that happened on a connection.
///
/// Yielded by [`Connection::next_event`] in occurrence order.
#[derive(Debug)]
pub enum Event {
    /// The connection reached the `Open` state. First event on every
    /// connection.
    Open,
    /// A complete (possibly reassembled, possibly decompressed) data
    /// message.
    Message(Bytes),
    /// A ping arrived; a pong echoing the payload has been queued
    /// automatically.
    Ping(Bytes),
    /// A pong arrived.
    Pong(Bytes),
    /// Something went wrong. Fatal errors are followed by [`Event::Close`];
    /// decompression failures are not, and the connection keeps decoding.
    Error(WebSocketError),
    /// The connection is closed. Carries the peer's close reason when one
    /// was received. Delivered exactly once; the event stream ends after it.
    Close(Option<Bytes>),
}

/// In-progress fragmented message: whether the starting frame carried RSV1.
struct Fragment {
    is_compressed: bool,
}

/// A WebSocket connection over any byte stream.
///
/// Created by [`Client::connect`](crate::Client::connect) or handed to the
/// server's connection handler; generic over the transport so the same state
/// machine runs over TCP, TLS, or in-memory streams.
pub struct Connection<S> {
    stream: Framed<S, Codec>,
    role: Role,
    ready_state: ReadyState,
    /// Whether we have sent a CLOSE frame.
    sent_close: bool,
    open_pending: bool,
    close_emitted: bool,
    /// Close event waiting to be delivered once obligated writes are out.
    pending_close: Option<Option<Bytes>>,
    /// Shut the transport down before delivering the pending close.
    shutdown_pending: bool,
    fragment: Option<Fragment>,
    accumulated: BytesMut,
    /// Protocol-mandated frames (pong echoes, reciprocal CLOSE) that must go
    /// out before anything else.
    obligated_sends: VecDeque<Frame>,
    flush_sends: bool,
    deflate: Option<Compressor>,
    inflate: Option<Decompressor>,
    max_message_length: usize,
    max_message_read: usize,
    /// Server-initiated shutdown channel; see `Server::close`.
    close_signal: Option<tokio::sync::mpsc::UnboundedReceiver<()>>,
    /// Invoked once when the close event is delivered (registry removal).
    on_closed: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a freshly upgraded stream.
    ///
    /// `read_buf` carries any bytes that arrived after the handshake
    /// sentinel; they are decoded before anything newly read from the
    /// transport.
    pub(crate) fn new(role: Role, stream: S, read_buf: BytesMut, config: Config) -> Self {
        let codec = Codec::new(role, config.max_frame_read);

        let mut parts = FramedParts::new::<Frame>(stream, codec);
        parts.read_buf = read_buf;
        parts.read_buf.reserve(config.socket_buffer_length);

        Self {
            stream: Framed::from_parts(parts),
            role,
            ready_state: ReadyState::Connecting,
            sent_close: false,
            open_pending: true,
            close_emitted: false,
            pending_close: None,
            shutdown_pending: false,
            fragment: None,
            accumulated: BytesMut::with_capacity(1024),
            obligated_sends: VecDeque::new(),
            flush_sends: false,
            deflate: config
                .deflate
                .then(|| Compressor::new(config.compression_level)),
            inflate: config.deflate.then(Decompressor::new),
            max_message_length: config.max_message_length,
            max_message_read: config.max_message_read,
            close_signal: None,
            on_closed: None,
        }
    }

    /// The endpoint role of this side of the connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    pub(crate) fn set_close_signal(&mut self, rx: tokio::sync::mpsc::UnboundedReceiver<()>) {
        self.close_signal = Some(rx);
    }

    pub(crate) fn set_on_closed(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_closed = Some(Box::new(f));
    }

    /// Waits for the next event, or `None` once the close event has been
    /// delivered.
    pub async fn next_event(&mut self) -> Option<Event> {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Polls for the next event. The poll-based twin of
    /// [`Connection::next_event`], also used by the `Stream` impl.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        loop {
            if self.open_pending {
                self.open_pending = false;
                self.ready_state = ReadyState::Open;
                return Poll::Ready(Some(Event::Open));
            }

            // A server shutting down asks each connection to close.
            let mut server_close = false;
            if let Some(rx) = self.close_signal.as_mut() {
                if let Poll::Ready(Some(())) = rx.poll_recv(cx) {
                    server_close = true;
                }
            }
            if server_close {
                self.close_signal = None;
                if self.ready_state < ReadyState::Closing {
                    if !self.sent_close {
                        self.obligated_sends
                            .push_back(Frame::close(CloseCode::Away, []));
                        self.sent_close = true;
                    }
                    self.ready_state = ReadyState::Closing;
                    self.shutdown_pending = true;
                    if self.pending_close.is_none() {
                        self.pending_close = Some(None);
                    }
                }
            }

            match self.poll_flush_obligated(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(err)) => {
                    log::error!("websocket {} transport failed: {err}", self.role);
                    self.obligated_sends.clear();
                    self.flush_sends = false;
                    self.shutdown_pending = false;
                    self.ready_state = ReadyState::Closed;
                    if self.pending_close.is_none() && !self.close_emitted {
                        self.pending_close = Some(None);
                    }
                    return Poll::Ready(Some(Event::Error(err)));
                }
                Poll::Pending => return Poll::Pending,
            }

            if self.shutdown_pending {
                // Best-effort half-close once the CLOSE frame is on the wire.
                if Pin::new(self.stream.get_mut()).poll_shutdown(cx).is_pending() {
                    return Poll::Pending;
                }
                self.shutdown_pending = false;
                self.ready_state = ReadyState::Closed;
            }

            if let Some(reason) = self.pending_close.take() {
                self.ready_state = ReadyState::Closed;
                self.close_emitted = true;
                if let Some(on_closed) = self.on_closed.take() {
                    on_closed();
                }
                return Poll::Ready(Some(Event::Close(reason)));
            }

            if self.close_emitted || self.ready_state == ReadyState::Closed {
                return Poll::Ready(None);
            }

            match ready!(self.stream.poll_next_unpin(cx)) {
                None => {
                    // Transport EOF without a close frame.
                    self.ready_state = ReadyState::Closed;
                    self.pending_close = Some(None);
                }
                Some(Err(err)) => return Poll::Ready(Some(self.on_stream_error(err))),
                Some(Ok(frame)) => match self.on_frame(frame) {
                    Ok(Some(event)) => return Poll::Ready(Some(event)),
                    Ok(None) => {}
                    Err(err @ WebSocketError::Compression(_)) => {
                        // Inflate failures do not poison the frame stream.
                        log::error!("websocket {} inflate failed: {err}", self.role);
                        return Poll::Ready(Some(Event::Error(err)));
                    }
                    Err(err) => return Poll::Ready(Some(self.on_stream_error(err))),
                },
            }
        }
    }

    /// Sends a data message, compressing and fragmenting as configured.
    ///
    /// Payloads above `max_message_length` go out as a first frame carrying
    /// the opcode (and RSV1 when compressed) followed by continuation
    /// frames, FIN on the last.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        if self.ready_state != ReadyState::Open {
            return Err(WebSocketError::ConnectionClosed);
        }

        self.flush_obligated().await?;

        let (opcode, payload) = message.into_parts();

        let (payload, compressed) = match self.deflate.as_mut() {
            Some(deflate) if !payload.is_empty() => {
                let output = deflate
                    .compress(&payload)
                    .map_err(WebSocketError::Compression)?;
                (output.freeze(), true)
            }
            _ => (payload, false),
        };

        if payload.len() <= self.max_message_length {
            let frame = if compressed {
                Frame::compressed(true, opcode, &payload[..])
            } else {
                Frame::new(true, opcode, None, &payload[..])
            };
            return self.stream.send(frame).await;
        }

        let total = payload.len();
        let mut offset = 0;
        let mut first = true;
        while offset < total {
            let end = (offset + self.max_message_length).min(total);
            let chunk = &payload[offset..end];
            let last = end == total;

            // RSV1 only on the starting frame; continuations leave it clear.
            let frame = if first && compressed {
                Frame::compressed(false, opcode, chunk)
            } else if first {
                Frame::new(false, opcode, None, chunk)
            } else {
                Frame::continuation(chunk).with_fin(last)
            };

            self.stream.feed(frame).await?;

            offset = end;
            first = false;
        }

        SinkExt::<Frame>::flush(&mut self.stream).await
    }

    /// Sends a ping frame. The payload must fit a control frame (≤ 125
    /// bytes).
    pub async fn send_ping(&mut self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control(Frame::ping(payload.as_ref())).await
    }

    /// Sends a pong frame. Unsolicited pongs are allowed by RFC 6455.
    pub async fn send_pong(&mut self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control(Frame::pong(payload.as_ref())).await
    }

    /// Starts a graceful close: sends a CLOSE frame and transitions to
    /// `Closing`. The peer's reciprocal CLOSE (or transport EOF) produces
    /// the final [`Event::Close`], so keep polling events until then.
    pub async fn close(&mut self, code: CloseCode, reason: impl AsRef<[u8]>) -> Result<()> {
        if self.ready_state == ReadyState::Closed {
            return Err(WebSocketError::ConnectionClosed);
        }
        if self.sent_close {
            return Ok(());
        }

        let frame = Frame::close(code, reason);
        if frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        self.flush_obligated().await?;
        self.stream.send(frame).await?;
        self.sent_close = true;
        self.ready_state = ReadyState::Closing;
        Ok(())
    }

    /// Hard stop: forcibly closes the transport and queues the close event.
    ///
    /// Pending outbound writes may be lost. The close event still fires
    /// exactly once, carrying `reason`; after it, no further events.
    pub async fn destroy(&mut self, reason: Option<Bytes>) {
        let _ = self.stream.get_mut().shutdown().await;

        self.open_pending = false;
        self.obligated_sends.clear();
        self.flush_sends = false;
        self.shutdown_pending = false;
        self.ready_state = ReadyState::Closed;
        if !self.close_emitted && self.pending_close.is_none() {
            self.pending_close = Some(reason);
        }
    }

    async fn send_control(&mut self, frame: Frame) -> Result<()> {
        if self.ready_state == ReadyState::Closed || self.sent_close {
            return Err(WebSocketError::ConnectionClosed);
        }
        if frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        self.flush_obligated().await?;
        self.stream.send(frame).await
    }

    /// Drains protocol-mandated frames so user frames never overtake them.
    async fn flush_obligated(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_flush_obligated(cx)).await
    }

    /// Routes a decoded frame, producing an event or absorbing it into
    /// fragment state.
    fn on_frame(&mut self, frame: Frame) -> Result<Option<Event>> {
        match frame.opcode {
            OpCode::Ping => {
                self.obligated_sends.push_back(Frame::pong(&frame.payload[..]));
                Ok(Some(Event::Ping(frame.payload.freeze())))
            }
            OpCode::Pong => Ok(Some(Event::Pong(frame.payload.freeze()))),
            OpCode::Close => self.on_close(frame),
            OpCode::Text | OpCode::Binary => self.on_data(frame),
            OpCode::Continuation => self.on_continuation(frame),
        }
    }

    fn on_close(&mut self, frame: Frame) -> Result<Option<Event>> {
        match frame.payload.len() {
            0 => {}
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = frame.close_code().expect("length checked");
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
            }
        }

        if !self.sent_close {
            self.obligated_sends
                .push_back(Frame::close_raw(&frame.payload[..]));
            self.sent_close = true;
        }

        let reason = if frame.payload.len() >= 2 {
            Some(frame.payload.freeze().slice(2..))
        } else {
            None
        };

        self.ready_state = ReadyState::Closing;
        self.shutdown_pending = true;
        self.pending_close = Some(reason);
        Ok(None)
    }

    fn on_data(&mut self, frame: Frame) -> Result<Option<Event>> {
        if self.ready_state == ReadyState::Closing {
            // No message events after Closing.
            return Ok(None);
        }
        if self.fragment.is_some() {
            return Err(WebSocketError::InvalidFragment);
        }
        if frame.is_compressed && self.inflate.is_none() {
            return Err(WebSocketError::CompressionNotSupported);
        }

        if !frame.fin {
            self.fragment = Some(Fragment {
                is_compressed: frame.is_compressed,
            });
            self.accumulated.extend_from_slice(&frame.payload);
            return Ok(None);
        }

        if frame.is_compressed && !frame.payload.is_empty() {
            let inflate = self.inflate.as_mut().expect("inflate checked above");
            let payload = inflate
                .decompress(&frame.payload)
                .map_err(WebSocketError::Compression)?;
            Ok(Some(Event::Message(payload.freeze())))
        } else {
            Ok(Some(Event::Message(frame.payload.freeze())))
        }
    }

    fn on_continuation(&mut self, frame: Frame) -> Result<Option<Event>> {
        if self.fragment.is_none() {
            return Err(WebSocketError::InvalidFragment);
        }
        if self.accumulated.len() + frame.payload.len() > self.max_message_read {
            return Err(WebSocketError::FrameTooLarge);
        }

        self.accumulated.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        // Swap in a fresh buffer so one huge message doesn't pin its
        // capacity for the life of the connection.
        let payload = std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));
        let fragment = self.fragment.take().expect("fragment checked above");

        if self.ready_state == ReadyState::Closing {
            return Ok(None);
        }

        if fragment.is_compressed && !payload.is_empty() {
            let inflate = self
                .inflate
                .as_mut()
                .ok_or(WebSocketError::CompressionNotSupported)?;
            let payload = inflate
                .decompress(&payload)
                .map_err(WebSocketError::Compression)?;
            Ok(Some(Event::Message(payload.freeze())))
        } else {
            Ok(Some(Event::Message(payload.freeze())))
        }
    }

    /// Handles a fatal decode or transport error: protocol violations send
    /// a CLOSE frame whose reason is the error text, then the transport is
    /// torn down and the close event queued.
    fn on_stream_error(&mut self, err: WebSocketError) -> Event {
        log::error!("websocket {} error: {err}", self.role);

        if err.is_protocol_violation() && !self.sent_close {
            let code = match err {
                WebSocketError::FrameTooLarge => CloseCode::Size,
                WebSocketError::InvalidOpCode(_) => CloseCode::Unsupported,
                _ => CloseCode::Protocol,
            };
            self.obligated_sends
                .push_back(Frame::close(code, err.to_string()));
            self.sent_close = true;
        }

        self.ready_state = ReadyState::Closing;
        self.shutdown_pending = true;
        if self.pending_close.is_none() {
            self.pending_close = Some(None);
        }
        Event::Error(err)
    }

    /// Drains the obligated-control queue ahead of any other progress.
    fn poll_flush_obligated(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        while !self.obligated_sends.is_empty() {
            ready!(self.stream.poll_ready_unpin(cx))?;

            let next = self.obligated_sends.pop_front().expect("obligated send");
            self.stream.start_send_unpin(next)?;
            self.flush_sends = true;
        }

        if self.flush_sends {
            ready!(self.stream.poll_flush_unpin(cx))?;
            self.flush_sends = false;
        }

        Poll::Ready(Ok(()))
    }
}

impl<S> futures::Stream for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::codec::Decoder as _;

    fn config(deflate: bool, max_message_length: usize) -> Config {
        Config {
            deflate,
            max_message_length,
            ..Config::default()
        }
    }

    fn pair(cfg: Config) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(1 << 22);
        let client = Connection::new(Role::Client, client_io, BytesMut::new(), cfg.clone());
        let server = Connection::new(Role::Server, server_io, BytesMut::new(), cfg);
        (client, server)
    }

    async fn expect_open<S: AsyncRead + AsyncWrite + Unpin>(conn: &mut Connection<S>) {
        assert_eq!(conn.ready_state(), ReadyState::Connecting);
        assert!(matches!(conn.next_event().await, Some(Event::Open)));
        assert_eq!(conn.ready_state(), ReadyState::Open);
    }

    /// Decodes every complete frame sitting in `raw`, as the peer would see
    /// them on the wire.
    async fn read_wire_frames(raw: &mut DuplexStream, role: Role) -> Vec<Frame> {
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; 4096];
        let mut decoder = Decoder::new(role, usize::MAX);
        let mut frames = Vec::new();

        loop {
            let n = raw.read(&mut chunk).await.expect("read");
            buf.extend_from_slice(&chunk[..n]);
            while let Some(frame) = decoder.decode(&mut buf).expect("decode") {
                frames.push(frame);
            }
            if buf.is_empty() && !frames.is_empty() {
                break frames;
            }
            if n == 0 {
                break frames;
            }
        }
    }

    #[tokio::test]
    async fn open_is_the_first_event() {
        let (mut client, mut server) = pair(config(false, 4096));
        expect_open(&mut client).await;
        expect_open(&mut server).await;
    }

    #[tokio::test]
    async fn text_echo() {
        let (mut client, mut server) = pair(config(false, 4096));
        expect_open(&mut client).await;
        expect_open(&mut server).await;

        client.send(Message::text("ping")).await.expect("send");
        match server.next_event().await {
            Some(Event::Message(payload)) => assert_eq!(&payload[..], b"ping"),
            other => panic!("expected message, got {other:?}"),
        }

        server.send(Message::text("pong")).await.expect("send");
        match client.next_event().await {
            Some(Event::Message(payload)) => assert_eq!(&payload[..], b"pong"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_frames_are_masked_on_the_wire() {
        let (client_io, mut raw) = tokio::io::duplex(4096);
        let mut client = Connection::new(
            Role::Client,
            client_io,
            BytesMut::new(),
            config(false, 4096),
        );
        expect_open(&mut client).await;
        client.send(Message::text("ping")).await.expect("send");

        let mut head = [0u8; 2];
        raw.read_exact(&mut head).await.expect("read");
        assert_eq!(head[0], 0x81);
        assert_eq!(head[1] & 0x80, 0x80, "client frame must carry the mask bit");
    }

    #[tokio::test]
    async fn server_frames_are_unmasked_on_the_wire() {
        let (server_io, mut raw) = tokio::io::duplex(4096);
        let mut server = Connection::new(
            Role::Server,
            server_io,
            BytesMut::new(),
            config(false, 4096),
        );
        expect_open(&mut server).await;
        server.send(Message::text("pong")).await.expect("send");

        let mut head = [0u8; 2];
        raw.read_exact(&mut head).await.expect("read");
        assert_eq!(head[1] & 0x80, 0, "server frame must not carry the mask bit");
    }

    #[tokio::test]
    async fn ping_yields_event_and_auto_pong() {
        let (mut client, mut server) = pair(config(false, 4096));
        expect_open(&mut client).await;
        expect_open(&mut server).await;

        client.send_ping("test").await.expect("ping");

        match server.next_event().await {
            Some(Event::Ping(payload)) => assert_eq!(&payload[..], b"test"),
            other => panic!("expected ping, got {other:?}"),
        }

        // Drive the server so the queued pong goes out, while the client
        // waits for it.
        let server_task = tokio::spawn(async move { server.next_event().await });

        match client.next_event().await {
            Some(Event::Pong(payload)) => assert_eq!(&payload[..], b"test"),
            other => panic!("expected pong, got {other:?}"),
        }

        client.close(CloseCode::Normal, "").await.expect("close");
        drop(client);
        server_task.await.expect("join");
    }

    #[tokio::test]
    async fn oversized_control_payload_is_rejected() {
        let (mut client, _server) = pair(config(false, 4096));
        expect_open(&mut client).await;

        let payload = vec![0u8; 126];
        assert!(matches!(
            client.send_ping(&payload).await,
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[tokio::test]
    async fn large_message_is_fragmented_on_the_wire() {
        let fragment_size = 1024 * 1024;
        let (client_io, mut raw) = tokio::io::duplex(1 << 23);
        let mut client = Connection::new(
            Role::Client,
            client_io,
            BytesMut::new(),
            config(false, fragment_size),
        );
        expect_open(&mut client).await;

        let payload = Bytes::from(vec![0u8; 3 * fragment_size]);
        client.send(Message::Binary(payload)).await.expect("send");

        let frames = read_wire_frames(&mut raw, Role::Server).await;
        assert_eq!(frames.len(), 3);

        assert_eq!(frames[0].opcode, OpCode::Binary);
        assert!(!frames[0].fin);
        assert_eq!(frames[0].payload.len(), fragment_size);

        assert_eq!(frames[1].opcode, OpCode::Continuation);
        assert!(!frames[1].fin);
        assert_eq!(frames[1].payload.len(), fragment_size);

        assert_eq!(frames[2].opcode, OpCode::Continuation);
        assert!(frames[2].fin);
        assert_eq!(frames[2].payload.len(), fragment_size);
    }

    #[tokio::test]
    async fn fragmented_message_reassembles() {
        let fragment_size = 1024 * 1024;
        let (mut client, mut server) = pair(config(false, fragment_size));
        expect_open(&mut client).await;
        expect_open(&mut server).await;

        let payload = Bytes::from(vec![7u8; 3 * fragment_size]);
        let expected = payload.clone();

        let send_task = tokio::spawn(async move {
            client.send(Message::Binary(payload)).await.expect("send");
            client
        });

        match server.next_event().await {
            Some(Event::Message(received)) => {
                assert_eq!(received.len(), 3 * fragment_size);
                assert_eq!(received, expected);
            }
            other => panic!("expected message, got {other:?}"),
        }

        send_task.await.expect("join");
    }

    #[tokio::test]
    async fn compressed_round_trip() {
        let (mut client, mut server) = pair(config(true, 4096));
        expect_open(&mut client).await;
        expect_open(&mut server).await;

        let text = "/".repeat(3 * 1024 * 1024);
        let expected = Bytes::from(text.clone().into_bytes());

        let send_task = tokio::spawn(async move {
            client.send(Message::text(text)).await.expect("send");
            client
        });

        match server.next_event().await {
            Some(Event::Message(received)) => assert_eq!(received, expected),
            other => panic!("expected message, got {other:?}"),
        }

        let mut client = send_task.await.expect("join");

        // And back the other way.
        let text = "/".repeat(3 * 1024 * 1024);
        let expected = Bytes::from(text.clone().into_bytes());
        let send_task = tokio::spawn(async move {
            server.send(Message::text(text)).await.expect("send");
            server
        });

        match client.next_event().await {
            Some(Event::Message(received)) => assert_eq!(received, expected),
            other => panic!("expected message, got {other:?}"),
        }

        send_task.await.expect("join");
    }

    #[tokio::test]
    async fn compressed_fragments_carry_rsv1_only_on_first_frame() {
        let (client_io, mut raw) = tokio::io::duplex(1 << 20);
        let mut client =
            Connection::new(Role::Client, client_io, BytesMut::new(), config(true, 64));
        expect_open(&mut client).await;

        // Incompressible payload so the deflate output exceeds the 64-byte
        // fragmentation threshold.
        let payload: Vec<u8> = (0..4096u32)
            .flat_map(|i| i.wrapping_mul(2654435761).to_be_bytes())
            .collect();
        client
            .send(Message::Binary(Bytes::from(payload)))
            .await
            .expect("send");

        let frames = read_wire_frames(&mut raw, Role::Server).await;
        assert!(frames.len() > 1, "deflate output must have been fragmented");
        assert!(frames[0].is_compressed, "RSV1 on the first frame");
        assert_eq!(frames[0].opcode, OpCode::Binary);
        for frame in &frames[1..] {
            assert!(!frame.is_compressed, "RSV1 clear on continuations");
            assert_eq!(frame.opcode, OpCode::Continuation);
        }
        assert!(frames.last().expect("frames").fin);
    }

    #[tokio::test]
    async fn empty_message_is_not_compressed() {
        let (client_io, mut raw) = tokio::io::duplex(4096);
        let mut client =
            Connection::new(Role::Client, client_io, BytesMut::new(), config(true, 4096));
        expect_open(&mut client).await;

        client.send(Message::text("")).await.expect("send");

        let mut head = [0u8; 2];
        raw.read_exact(&mut head).await.expect("read");
        assert_eq!(head[0] & 0x40, 0, "RSV1 must stay clear on empty messages");
    }

    #[tokio::test]
    async fn graceful_close_handshake() {
        let (mut client, mut server) = pair(config(false, 4096));
        expect_open(&mut client).await;
        expect_open(&mut server).await;

        client.close(CloseCode::Normal, "bye").await.expect("close");
        assert_eq!(client.ready_state(), ReadyState::Closing);

        // Server sees the close, echoes it, and reports the reason.
        match server.next_event().await {
            Some(Event::Close(Some(reason))) => assert_eq!(&reason[..], b"bye"),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(server.ready_state(), ReadyState::Closed);
        assert!(server.next_event().await.is_none());

        // Client sees the echoed close.
        match client.next_event().await {
            Some(Event::Close(Some(reason))) => assert_eq!(&reason[..], b"bye"),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(client.ready_state(), ReadyState::Closed);
        assert!(client.next_event().await.is_none());
    }

    #[tokio::test]
    async fn close_is_emitted_exactly_once() {
        let (mut client, mut server) = pair(config(false, 4096));
        expect_open(&mut client).await;
        expect_open(&mut server).await;

        client.close(CloseCode::Normal, "").await.expect("close");

        let mut closes = 0;
        while let Some(event) = server.next_event().await {
            if matches!(event, Event::Close(_)) {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
        assert!(server.next_event().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut client, _server) = pair(config(false, 4096));
        expect_open(&mut client).await;

        client.close(CloseCode::Normal, "").await.expect("close");
        assert!(matches!(
            client.send(Message::text("late")).await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn destroy_emits_close_once_and_nothing_after() {
        let (mut client, _server) = pair(config(false, 4096));
        expect_open(&mut client).await;

        client.destroy(Some(Bytes::from_static(b"gone"))).await;

        match client.next_event().await {
            Some(Event::Close(Some(reason))) => assert_eq!(&reason[..], b"gone"),
            other => panic!("expected close, got {other:?}"),
        }
        assert!(client.next_event().await.is_none());
        assert!(client.next_event().await.is_none());

        // Destroying again changes nothing.
        client.destroy(None).await;
        assert!(client.next_event().await.is_none());
    }

    #[tokio::test]
    async fn unmasked_frame_closes_with_reason() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, server_io) = tokio::io::duplex(4096);
        let mut server = Connection::new(
            Role::Server,
            server_io,
            BytesMut::new(),
            config(false, 4096),
        );
        expect_open(&mut server).await;

        // An unmasked TEXT frame, which a server must reject.
        let mut wire = vec![0x81u8, 9];
        wire.extend_from_slice(b"willclose");
        raw.write_all(&wire).await.expect("write");

        match server.next_event().await {
            Some(Event::Error(WebSocketError::UnmaskedFrame)) => {}
            other => panic!("expected unmasked-frame error, got {other:?}"),
        }
        match server.next_event().await {
            Some(Event::Close(None)) => {}
            other => panic!("expected close, got {other:?}"),
        }
        assert!(server.next_event().await.is_none());

        // The wire carries a CLOSE frame whose reason is the error text.
        let frames = read_wire_frames(&mut raw, Role::Client).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Close);
        assert_eq!(frames[0].close_code(), Some(CloseCode::Protocol));
        assert_eq!(frames[0].close_reason(), b"unmasked frame");
    }

    #[tokio::test]
    async fn continuation_without_start_is_fatal() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, client_io) = tokio::io::duplex(4096);
        let mut client = Connection::new(
            Role::Client,
            client_io,
            BytesMut::new(),
            config(false, 4096),
        );
        expect_open(&mut client).await;

        // FIN + CONTINUATION with a 2-byte payload, unmasked (server style).
        raw.write_all(&[0x80, 2, b'h', b'i']).await.expect("write");

        match client.next_event().await {
            Some(Event::Error(WebSocketError::InvalidFragment)) => {}
            other => panic!("expected invalid-fragment error, got {other:?}"),
        }
        assert!(matches!(client.next_event().await, Some(Event::Close(None))));
    }

    #[tokio::test]
    async fn data_frame_during_fragmentation_is_fatal() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, client_io) = tokio::io::duplex(4096);
        let mut client = Connection::new(
            Role::Client,
            client_io,
            BytesMut::new(),
            config(false, 4096),
        );
        expect_open(&mut client).await;

        // TEXT without FIN starts a message; a second TEXT may not start
        // another.
        raw.write_all(&[0x01, 1, b'a']).await.expect("write");
        raw.write_all(&[0x81, 1, b'b']).await.expect("write");

        match client.next_event().await {
            Some(Event::Error(WebSocketError::InvalidFragment)) => {}
            other => panic!("expected invalid-fragment error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interleaved_ping_during_fragmentation() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, client_io) = tokio::io::duplex(4096);
        let mut client = Connection::new(
            Role::Client,
            client_io,
            BytesMut::new(),
            config(false, 4096),
        );
        expect_open(&mut client).await;

        raw.write_all(&[0x01, 1, b'a']).await.expect("write"); // TEXT, no FIN
        raw.write_all(&[0x89, 0]).await.expect("write"); // PING between fragments
        raw.write_all(&[0x80, 1, b'b']).await.expect("write"); // CONTINUATION, FIN

        assert!(matches!(client.next_event().await, Some(Event::Ping(_))));
        match client.next_event().await {
            Some(Event::Message(payload)) => assert_eq!(&payload[..], b"ab"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn arbitrary_chunk_boundaries_yield_identical_messages() {
        use tokio::io::AsyncWriteExt;

        // One TEXT frame split at every possible boundary.
        let mut wire = vec![0x81u8, 11];
        wire.extend_from_slice(b"hello world");

        for split in 0..wire.len() {
            let (mut raw, client_io) = tokio::io::duplex(4096);
            let mut client = Connection::new(
                Role::Client,
                client_io,
                BytesMut::new(),
                config(false, 4096),
            );
            expect_open(&mut client).await;

            raw.write_all(&wire[..split]).await.expect("write");
            raw.flush().await.expect("flush");
            raw.write_all(&wire[split..]).await.expect("write");

            match client.next_event().await {
                Some(Event::Message(payload)) => assert_eq!(&payload[..], b"hello world"),
                other => panic!("split={split}: expected message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn prebuffered_handshake_bytes_are_decoded_first() {
        // Frame bytes that arrived glued to the handshake response.
        let mut read_buf = BytesMut::new();
        read_buf.extend_from_slice(&[0x81, 5]);
        read_buf.extend_from_slice(b"early");

        let (_raw, client_io) = tokio::io::duplex(4096);
        let mut client =
            Connection::new(Role::Client, client_io, read_buf, config(false, 4096));
        expect_open(&mut client).await;

        match client.next_event().await {
            Some(Event::Message(payload)) => assert_eq!(&payload[..], b"early"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inflate_failure_does_not_close_the_connection() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, client_io) = tokio::io::duplex(4096);
        let mut client =
            Connection::new(Role::Client, client_io, BytesMut::new(), config(true, 4096));
        expect_open(&mut client).await;

        // RSV1 + TEXT with garbage that cannot inflate.
        raw.write_all(&[0xC1, 4, 0xFF, 0xFF, 0x12, 0x34])
            .await
            .expect("write");

        match client.next_event().await {
            Some(Event::Error(WebSocketError::Compression(_))) => {}
            other => panic!("expected compression error, got {other:?}"),
        }
        assert_eq!(client.ready_state(), ReadyState::Open);

        // The connection keeps decoding subsequent frames.
        raw.write_all(&[0x81, 2, b'o', b'k']).await.expect("write");
        match client.next_event().await {
            Some(Event::Message(payload)) => assert_eq!(&payload[..], b"ok"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_without_close_frame_still_emits_close() {
        let (raw, client_io) = tokio::io::duplex(4096);
        let mut client = Connection::new(
            Role::Client,
            client_io,
            BytesMut::new(),
            config(false, 4096),
        );
        expect_open(&mut client).await;

        drop(raw);

        assert!(matches!(client.next_event().await, Some(Event::Close(None))));
        assert!(client.next_event().await.is_none());
    }
}
