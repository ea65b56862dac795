//! The client endpoint: URL validation, TCP/TLS dialing, and the upgrade
//! handshake.

use std::{future::IntoFuture, io, sync::Arc};

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use url::Url;

use crate::{
    codec::Role,
    compression::CompressionLevel,
    connection::{Config, Connection, DEFAULT_MAX_MESSAGE_LENGTH, DEFAULT_SOCKET_BUFFER_LENGTH},
    handshake::{self, MAX_HANDSHAKE_SIZE},
    stream::MaybeTlsStream,
    Result, WebSocketError,
};

/// The connection type produced by [`Client::connect`].
pub type TcpConnection = Connection<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// Verify the server's TLS certificate chain against the system's web
    /// PKI roots. Turning this off accepts any certificate.
    pub reject_unauthorized: bool,
    /// Advertise `permessage-deflate` in the handshake.
    pub offer_per_message_deflate: bool,
    /// Deflate level used when compression is negotiated.
    pub compression_level: CompressionLevel,
    /// Outbound fragmentation threshold, in bytes.
    pub max_message_length: usize,
    /// Transport read-buffer size, in bytes.
    pub socket_buffer_length: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reject_unauthorized: true,
            offer_per_message_deflate: true,
            compression_level: CompressionLevel::default(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            socket_buffer_length: DEFAULT_SOCKET_BUFFER_LENGTH,
        }
    }
}

/// Entry point for outbound connections.
pub struct Client;

impl Client {
    /// Starts a connection to `url` (`ws://` or `wss://`).
    ///
    /// Returns a builder: awaiting it dials, performs the handshake, and
    /// resolves to an open [`Connection`]. Configure it first with
    /// [`ClientBuilder::with_options`] when the defaults don't fit.
    ///
    /// ```no_run
    /// # async fn example() -> webtide::Result<()> {
    /// let ws = webtide::Client::connect("wss://example.com/feed".parse()?)
    ///     .with_options(webtide::ClientOptions {
    ///         offer_per_message_deflate: false,
    ///         ..Default::default()
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect(url: Url) -> ClientBuilder {
        ClientBuilder {
            url,
            options: ClientOptions::default(),
            connector: None,
        }
    }
}

/// Configures and performs a client connection; created by
/// [`Client::connect`].
pub struct ClientBuilder {
    url: Url,
    options: ClientOptions,
    connector: Option<TlsConnector>,
}

impl ClientBuilder {
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Supplies a pre-built TLS connector, replacing the one derived from
    /// [`ClientOptions::reject_unauthorized`].
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }
}

impl IntoFuture for ClientBuilder {
    type Output = Result<TcpConnection>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(connect_priv(self))
    }
}

async fn connect_priv(builder: ClientBuilder) -> Result<TcpConnection> {
    let ClientBuilder {
        url,
        options,
        connector,
    } = builder;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(WebSocketError::InvalidUrl);
    }

    let host = url.host_str().ok_or(WebSocketError::InvalidUrl)?.to_string();
    // The url crate knows the default ports for ws (80) and wss (443).
    let port = url.port_or_known_default().unwrap_or(80);

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let _ = tcp.set_nodelay(true);

    let stream = match url.scheme() {
        "ws" => MaybeTlsStream::Plain(tcp),
        _ => {
            let connector =
                connector.unwrap_or_else(|| tls_connector(options.reject_unauthorized));
            let domain = ServerName::try_from(host)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;

            MaybeTlsStream::from(connector.connect(domain, tcp).await?)
        }
    };

    handshake_over(stream, &url, options).await
}

/// Performs the upgrade handshake over an already-established stream.
///
/// Writes the request, reads until the response sentinel, verifies the
/// reply, and seeds the frame decoder with any bytes that arrived past the
/// header.
pub(crate) async fn handshake_over<S>(
    mut stream: S,
    url: &Url,
    options: ClientOptions,
) -> Result<Connection<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = handshake::generate_key();
    let request = handshake::client_request(url, &key, options.offer_per_message_deflate);
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some((reply, header_len)) = handshake::parse_response(&buf, &key)? {
            log::debug!(
                "client handshake complete for {url}, permessage-deflate={}",
                reply.deflate
            );

            let read_buf = BytesMut::from(&buf[header_len..]);
            let config = Config {
                deflate: options.offer_per_message_deflate && reply.deflate,
                compression_level: options.compression_level,
                max_message_length: options.max_message_length,
                socket_buffer_length: options.socket_buffer_length,
                ..Config::default()
            };

            return Ok(Connection::new(Role::Client, stream, read_buf, config));
        }

        if buf.len() > MAX_HANDSHAKE_SIZE {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
}

/// Builds the TLS connector: web PKI roots when verifying, a pass-through
/// verifier otherwise.
fn tls_connector(reject_unauthorized: bool) -> TlsConnector {
    let config = if reject_unauthorized {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification(provider)))
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

mod danger {
    use std::sync::Arc;

    use tokio_rustls::rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, SignatureScheme,
    };

    /// Accepts any server certificate. Installed only when the caller set
    /// `reject_unauthorized: false`; signatures are still checked so the
    /// session is at least self-consistent.
    #[derive(Debug)]
    pub(super) struct NoVerification(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
