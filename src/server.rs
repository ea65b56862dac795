//! The server endpoint: listening, the upgrade handshake, the HTTP
//! fallback, and the connection registry.
//!
//! ```no_run
//! use webtide::{Event, Message, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> webtide::Result<()> {
//!     let server = Server::bind("127.0.0.1:7357", ServerOptions::default()).await?;
//!     server
//!         .serve(|mut ws, _request| async move {
//!             while let Some(event) = ws.next_event().await {
//!                 if let Event::Message(payload) = event {
//!                     let _ = ws.send(Message::Binary(payload)).await;
//!                 }
//!             }
//!         })
//!         .await
//! }
//! ```

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{mpsc, watch},
};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::{
    codec::Role,
    compression::CompressionLevel,
    connection::{Config, Connection, DEFAULT_MAX_MESSAGE_LENGTH, DEFAULT_SOCKET_BUFFER_LENGTH},
    handshake::{self, UpgradeRequest, MAX_HANDSHAKE_SIZE},
    stream::MaybeTlsStream,
    Result, WebSocketError,
};

/// The connection type handed to the server's connection handler.
pub type ServerConnection = Connection<MaybeTlsStream<TcpStream>>;

/// Handler for HTTP requests that are not WebSocket upgrades. Returns the
/// raw response bytes to write before the stream is half-closed.
pub type HttpHandler = Arc<dyn Fn(&UpgradeRequest) -> Vec<u8> + Send + Sync>;

/// PEM-encoded TLS credentials for the secure server variant.
#[derive(Clone)]
pub struct TlsIdentity {
    /// Certificate chain, leaf first.
    pub cert_pem: Vec<u8>,
    /// Private key (PKCS#8, PKCS#1, or SEC1). Encrypted keys are not
    /// supported and fail construction.
    pub key_pem: Vec<u8>,
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerOptions {
    /// Accept a client's `permessage-deflate` offer.
    pub support_per_message_deflate: bool,
    /// Deflate level used when compression is negotiated.
    pub compression_level: CompressionLevel,
    /// Outbound fragmentation threshold, in bytes.
    pub max_message_length: usize,
    /// Per-connection transport read-buffer size, in bytes.
    pub socket_buffer_length: usize,
    /// Handler for plain HTTP requests. Defaults to a `200 OK` with body
    /// `OK`.
    pub http_handler: Option<HttpHandler>,
    /// TLS credentials; present makes this a `wss` server.
    pub tls: Option<TlsIdentity>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            support_per_message_deflate: false,
            compression_level: CompressionLevel::default(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            socket_buffer_length: DEFAULT_SOCKET_BUFFER_LENGTH,
            http_handler: None,
            tls: None,
        }
    }
}

/// Insertion-ordered set of live connections.
///
/// This is the only cross-connection shared state the server keeps, so it is
/// the only place that needs a lock.
struct Registry {
    entries: Mutex<Vec<(u64, mpsc::UnboundedSender<()>)>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.lock().expect("registry lock").push((id, tx));
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .expect("registry lock")
            .retain(|(entry_id, _)| *entry_id != id);
    }

    /// Signals every live connection to close, in insertion order.
    fn close_all(&self) {
        let entries = self.entries.lock().expect("registry lock");
        for (_, tx) in entries.iter() {
            let _ = tx.send(());
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("registry lock").len()
    }
}

/// Options shared by every accepted connection.
struct Shared {
    support_per_message_deflate: bool,
    compression_level: CompressionLevel,
    max_message_length: usize,
    socket_buffer_length: usize,
    http_handler: HttpHandler,
}

/// A bound WebSocket server.
///
/// [`Server::bind`] validates the options (including TLS credentials) and
/// binds the listener; [`Server::serve`] runs the accept loop, invoking the
/// given handler with each upgraded connection. [`Server::handle`] yields a
/// [`ServerHandle`] through which the server can be shut down.
pub struct Server {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Binds to `addr` with the given options.
    ///
    /// Fails with [`WebSocketError::InvalidOptions`] when TLS credentials
    /// are supplied but missing or unparseable.
    pub async fn bind(addr: impl ToSocketAddrs, options: ServerOptions) -> Result<Server> {
        let acceptor = match &options.tls {
            Some(identity) => Some(build_acceptor(identity)?),
            None => None,
        };

        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            listener,
            acceptor,
            shared: Arc::new(Shared {
                support_per_message_deflate: options.support_per_message_deflate,
                compression_level: options.compression_level,
                max_message_length: options.max_message_length,
                socket_buffer_length: options.socket_buffer_length,
                http_handler: options
                    .http_handler
                    .unwrap_or_else(|| Arc::new(default_http_handler)),
            }),
            registry: Arc::new(Registry::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The bound local address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that can shut the server down from another task.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    /// Runs the accept loop until [`ServerHandle::close`] is called.
    ///
    /// `handler` is invoked once per upgraded connection, in its own task,
    /// with the open [`ServerConnection`] and the parsed upgrade request
    /// (URL path and headers included).
    pub async fn serve<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(ServerConnection, UpgradeRequest) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::debug!("websocket server stopping");
                        break Ok(());
                    }
                }
                accepted = self.listener.accept() => {
                    let (tcp, peer) = accepted?;
                    let acceptor = self.acceptor.clone();
                    let shared = Arc::clone(&self.shared);
                    let registry = Arc::clone(&self.registry);
                    let handler = handler.clone();

                    tokio::spawn(async move {
                        if let Err(err) =
                            accept_connection(tcp, acceptor, shared, registry, handler).await
                        {
                            log::debug!("connection from {peer} failed: {err}");
                        }
                    });
                }
            }
        }
    }
}

/// Shuts a running [`Server`] down.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<Registry>,
    shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    /// Stops accepting new connections and closes every active connection
    /// in insertion order. Each connection sends a CLOSE frame (if it has
    /// not already) and tears its transport down.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.registry.close_all();
    }
}

fn default_http_handler(_request: &UpgradeRequest) -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK".to_vec()
}

fn build_acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut &identity.cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| WebSocketError::InvalidOptions)?;
    if certs.is_empty() {
        return Err(WebSocketError::InvalidOptions);
    }

    let key = rustls_pemfile::private_key(&mut &identity.key_pem[..])
        .map_err(|_| WebSocketError::InvalidOptions)?
        .ok_or(WebSocketError::InvalidOptions)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|_| WebSocketError::InvalidOptions)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn accept_connection<F, Fut>(
    tcp: TcpStream,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    handler: F,
) -> Result<()>
where
    F: Fn(ServerConnection, UpgradeRequest) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let _ = tcp.set_nodelay(true);

    let stream = match acceptor {
        Some(acceptor) => MaybeTlsStream::from(acceptor.accept(tcp).await?),
        None => MaybeTlsStream::Plain(tcp),
    };

    upgrade_connection(stream, shared, registry, handler).await
}

/// Reads one HTTP request and either upgrades it to a WebSocket connection
/// or dispatches it to the HTTP handler.
async fn upgrade_connection<F, Fut>(
    mut stream: MaybeTlsStream<TcpStream>,
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    handler: F,
) -> Result<()>
where
    F: Fn(ServerConnection, UpgradeRequest) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(1024);
    let (request, header_len) = loop {
        if let Some(parsed) = handshake::parse_request(&buf)? {
            break parsed;
        }
        if buf.len() > MAX_HANDSHAKE_SIZE {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    };

    if !request.is_upgrade {
        // A regular HTTP request; answer and hang up.
        let response = (shared.http_handler)(&request);
        stream.write_all(&response).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let key = match (request.key.as_deref(), request.version_ok) {
        (Some(key), true) => key.to_string(),
        (missing_key, _) => {
            stream
                .write_all(handshake::bad_request_response().as_bytes())
                .await?;
            stream.shutdown().await?;
            return Err(if missing_key.is_none() {
                WebSocketError::MissingSecWebSocketKey
            } else {
                WebSocketError::InvalidSecWebSocketVersion
            });
        }
    };

    let deflate = shared.support_per_message_deflate && request.deflate_offer.is_some();

    let response = handshake::upgrade_response(&handshake::accept_key(key.as_bytes()), deflate);
    stream.write_all(response.as_bytes()).await?;

    log::debug!(
        "upgraded {} to websocket, permessage-deflate={deflate}",
        request.path
    );

    let read_buf = BytesMut::from(&buf[header_len..]);
    let config = Config {
        deflate,
        compression_level: shared.compression_level,
        max_message_length: shared.max_message_length,
        socket_buffer_length: shared.socket_buffer_length,
        ..Config::default()
    };

    let mut connection = Connection::new(Role::Server, stream, read_buf, config);

    let (id, close_rx) = registry.register();
    connection.set_close_signal(close_rx);
    let registry_for_removal = Arc::clone(&registry);
    connection.set_on_closed(move || registry_for_removal.remove(id));

    handler(connection, request).await;
    Ok(())
}
