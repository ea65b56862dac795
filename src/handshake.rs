//! The HTTP upgrade handshake (RFC 6455 Section 4).
//!
//! Both sides of the handshake are codecs over raw bytes: builders produce
//! the request/response text, and the parsers consume a growing buffer,
//! returning `Ok(None)` until the `\r\n\r\n` sentinel has arrived. On
//! success the parsers report how many bytes the header consumed; anything
//! beyond that offset is pre-buffered frame data and must be fed to the
//! frame decoder before any further transport reads.

use std::str::FromStr;

use base64::prelude::*;
use sha1::{Digest, Sha1};
use url::Url;

use crate::{compression::DeflateOffer, Result, WebSocketError};

/// Protocol GUID appended to the client key before hashing
/// (RFC 6455 Section 1.3).
pub(crate) const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Hard cap on the buffered handshake header. A peer that has not produced
/// the sentinel within this many bytes is not speaking HTTP.
pub(crate) const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 32;

/// Generates a `Sec-WebSocket-Key`: 16 cryptographically random bytes,
/// base64-encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Computes the `Sec-WebSocket-Accept` digest for a client key:
/// `base64(sha1(key ++ GUID))`.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    let digest = sha1.finalize();
    BASE64_STANDARD.encode(&digest[..])
}

/// Builds the client's upgrade request for `url`, carrying `key` and, when
/// `offer_deflate` is set, the `permessage-deflate` extension offer.
///
/// Path, query, and fragment are transmitted verbatim in the request line;
/// the `Host` header includes the port only when the URL spells one out.
pub fn client_request(url: &Url, key: &str, offer_deflate: bool) -> String {
    let host = url.host_str().unwrap_or("localhost");
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    // Everything from the path onward, including ?query and #fragment.
    let target = &url[url::Position::BeforePath..];

    let mut request = format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if offer_deflate {
        request.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            DeflateOffer::client_default()
        ));
    }
    request.push_str("\r\n");
    request
}

/// Builds the server's `101 Switching Protocols` response. The extensions
/// header is present iff `deflate` was negotiated.
pub fn upgrade_response(accept: &str, deflate: bool) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if deflate {
        response.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            DeflateOffer::server_accept()
        ));
    }
    response.push_str("\r\n");
    response
}

/// The server's rejection of a malformed upgrade request.
pub fn bad_request_response() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\n\r\n"
}

/// What the server accepted in its 101 response, from the client's view.
#[derive(Debug)]
pub struct ServerReply {
    /// Whether the server accepted the `permessage-deflate` offer.
    pub deflate: bool,
}

/// Parses and verifies the server's handshake response.
///
/// Returns `Ok(None)` while the buffered bytes do not yet contain the
/// `\r\n\r\n` sentinel. On success returns the negotiated reply and the
/// header length in bytes; `buf[len..]` is pre-buffered frame data.
///
/// Verification: the status line must read `101`, the `Upgrade` header must
/// be `websocket`, and `Sec-WebSocket-Accept` must match the digest of
/// `key`.
pub fn parse_response(buf: &[u8], key: &str) -> Result<Option<(ServerReply, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(WebSocketError::InvalidUpgradeHeader),
    };

    let status = response.code.unwrap_or(0);
    if status != 101 {
        return Err(WebSocketError::InvalidStatusCode(status));
    }

    if !header_equals_ignore_case(response.headers, "Upgrade", b"websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    match find_header(response.headers, "Sec-WebSocket-Accept") {
        Some(value) if value == accept_key(key.as_bytes()).as_bytes() => {}
        _ => return Err(WebSocketError::InvalidAcceptKey),
    }

    let deflate = find_header(response.headers, "Sec-WebSocket-Extensions")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| DeflateOffer::from_str(v).ok())
        .is_some();

    Ok(Some((ServerReply { deflate }, len)))
}

/// A parsed client request, as seen by the server before deciding whether to
/// upgrade.
#[derive(Debug)]
pub struct UpgradeRequest {
    /// Request method (`GET` for upgrades).
    pub method: String,
    /// Request target: path plus query, verbatim.
    pub path: String,
    /// Whether the request asked for a WebSocket upgrade at all. When
    /// `false`, the request belongs to the plain HTTP handler.
    pub is_upgrade: bool,
    /// The client's `Sec-WebSocket-Key`, when present.
    pub key: Option<String>,
    /// Whether `Sec-WebSocket-Version` was 13.
    pub version_ok: bool,
    /// The client's `permessage-deflate` offer, when present and parseable.
    pub deflate_offer: Option<DeflateOffer>,
    /// All request headers, in arrival order.
    pub headers: Vec<(String, String)>,
}

/// Parses a client's opening request.
///
/// Returns `Ok(None)` while the buffered bytes do not yet contain the
/// sentinel; on success returns the request and the header length in bytes
/// (bytes past it are pre-buffered frame data).
///
/// Whether the request is an acceptable upgrade is left to the caller:
/// `is_upgrade == false` routes to the HTTP handler, an upgrade without a
/// key or with the wrong version earns a `400 Bad Request`.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(WebSocketError::InvalidUpgradeHeader),
    };

    let is_upgrade = header_equals_ignore_case(request.headers, "Upgrade", b"websocket");

    let key = find_header(request.headers, "Sec-WebSocket-Key")
        .and_then(|v| std::str::from_utf8(v).ok())
        .map(|v| v.trim().to_string());

    let version_ok = find_header(request.headers, "Sec-WebSocket-Version")
        .map(|v| v == b"13")
        .unwrap_or(false);

    let deflate_offer = find_header(request.headers, "Sec-WebSocket-Extensions")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| DeflateOffer::from_str(v).ok());

    let collected = request
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    Ok(Some((
        UpgradeRequest {
            method: request.method.unwrap_or("").to_string(),
            path: request.path.unwrap_or("/").to_string(),
            is_upgrade,
            key,
            version_ok,
            deflate_offer,
            headers: collected,
        },
        len,
    )))
}

fn find_header<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

fn header_equals_ignore_case(headers: &[httparse::Header<'_>], name: &str, want: &[u8]) -> bool {
    find_header(headers, name)
        .map(|v| v.eq_ignore_ascii_case(want))
        .unwrap_or(false)
}
