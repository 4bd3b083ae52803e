//! WebSocket upgrade handshake
//!
//! Incremental HTTP request parsing plus validation and response synthesis
//! for the server side of the RFC 6455 opening handshake.
//!
//! The request parser is deliberately head-only (request line + headers): an
//! upgrade request carries no body, and malformed requests must still come
//! out the other end as parsed requests so they can be answered with a
//! proper `400 Bad Request`.

use std::collections::VecDeque;

use base64::Engine;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::WS_GUID;
use crate::error::{Error, Result};

/// Maximum HTTP header block size (8KB should be enough for any reasonable request)
const MAX_HEADER_SIZE: usize = 8192;

/// A parsed HTTP request head
#[derive(Debug, Clone)]
pub struct HttpRequest {
    request_line: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// The raw request line, e.g. `GET /chat HTTP/1.1`
    #[inline]
    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    /// The method token (text before the first space)
    pub fn method(&self) -> &str {
        self.request_line
            .split_once(' ')
            .map(|(m, _)| m)
            .unwrap_or(&self.request_line)
    }

    /// The protocol token (text after the last space)
    pub fn protocol(&self) -> &str {
        self.request_line
            .rsplit_once(' ')
            .map(|(_, v)| v)
            .unwrap_or("")
    }

    /// Check whether a header is present (names are case-insensitive)
    pub fn has_header(&self, name: &str) -> bool {
        self.header_value(name).is_some()
    }

    /// Look up a header value by case-insensitive name
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Incremental HTTP request parser.
///
/// `parse` ingests bytes; completed request heads queue up and are drained
/// with [`RequestParser::pop`]. Bytes past a complete head stay buffered.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: BytesMut,
    requests: VecDeque<HttpRequest>,
}

impl RequestParser {
    /// Create a new request parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest bytes and parse any completed request heads.
    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);

        loop {
            let Some(head_end) = find_head_end(&self.buf) else {
                if self.buf.len() > MAX_HEADER_SIZE {
                    return Err(Error::InvalidHttp("request head too large"));
                }
                return Ok(());
            };

            let head = self.buf.split_to(head_end + 4);
            let head = std::str::from_utf8(&head[..head_end])
                .map_err(|_| Error::InvalidHttp("request head is not valid UTF-8"))?;

            self.requests.push_back(parse_head(head));
        }
    }

    /// True if no completed request is waiting
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Peek at the oldest completed request
    #[inline]
    pub fn front(&self) -> Option<&HttpRequest> {
        self.requests.front()
    }

    /// Dequeue the oldest completed request
    #[inline]
    pub fn pop(&mut self) -> Option<HttpRequest> {
        self.requests.pop_front()
    }
}

/// Locate the `\r\n\r\n` terminating the request head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Split a request head into its request line and headers.
///
/// Lines without a colon are skipped rather than rejected; the validator
/// decides what the request as a whole is worth.
fn parse_head(head: &str) -> HttpRequest {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("").to_string();

    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    HttpRequest {
        request_line,
        headers,
    }
}

/// A synthesized handshake response
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    status: u16,
    wire: Bytes,
}

impl HandshakeResponse {
    /// The HTTP status code (101, 400, or 403)
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The serialized response bytes
    #[inline]
    pub fn to_wire(&self) -> Bytes {
        self.wire.clone()
    }
}

/// Compute the `Sec-WebSocket-Accept` value: Base64(SHA-1(key + GUID)).
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate an upgrade request against the handshake rules.
///
/// The `Connection` substring match and the `Upgrade` value match are
/// case-sensitive, mirroring what this server has always accepted.
fn is_valid_handshake(request: &HttpRequest) -> bool {
    if request.method() != "GET" {
        warn!("invalid WebSocket request: method must be GET");
        return false;
    }

    let protocol = request.protocol();
    if protocol != "HTTP/1.1" && protocol != "HTTP/2" {
        warn!("invalid WebSocket request: only HTTP/1.1 and HTTP/2 are allowed");
        return false;
    }

    match request.header_value("Connection") {
        Some(v) if v.contains("Upgrade") => {}
        _ => {
            warn!("invalid WebSocket request: 'Connection: Upgrade' is required");
            return false;
        }
    }

    if request.header_value("Upgrade") != Some("websocket") {
        warn!("invalid WebSocket request: 'Upgrade: websocket' is required");
        return false;
    }

    /* require Sec-WebSocket-Key to protect against abuse */
    if !request.has_header("Sec-WebSocket-Key") {
        warn!("invalid WebSocket request: 'Sec-WebSocket-Key' is required");
        return false;
    }

    true
}

/// Synthesize the handshake response for a parsed upgrade request:
/// `101 Switching Protocols`, `400 Bad Request`, or `403 Forbidden`.
pub fn handshake_response(request: &HttpRequest) -> HandshakeResponse {
    if !is_valid_handshake(request) {
        return error_response(400, "Bad Request");
    }

    /* reject requests without Origin (maybe check for same origin later) */
    if !request.has_header("Origin") {
        warn!("rejecting WebSocket request without Origin");
        return error_response(403, "Forbidden");
    }

    let key = request
        .header_value("Sec-WebSocket-Key")
        .expect("validated above");
    let accept = accept_key(key);

    let wire = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    );

    HandshakeResponse {
        status: 101,
        wire: Bytes::from(wire),
    }
}

fn error_response(status: u16, reason: &str) -> HandshakeResponse {
    let wire = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    );

    HandshakeResponse {
        status,
        wire: Bytes::from(wire),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> HttpRequest {
        let mut parser = RequestParser::new();
        parser.parse(text.as_bytes()).unwrap();
        parser.pop().expect("complete request")
    }

    const VALID: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Origin: http://example.com\r\n\
        \r\n";

    #[test]
    fn accept_key_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn valid_request_gets_101() {
        let response = handshake_response(&request(VALID));
        assert_eq!(response.status(), 101);

        let text = std::str::from_utf8(&response.to_wire()).unwrap().to_string();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn http2_request_line_accepted() {
        let response = handshake_response(&request(&VALID.replace("HTTP/1.1", "HTTP/2")));
        assert_eq!(response.status(), 101);
    }

    #[test]
    fn post_gets_400() {
        let response = handshake_response(&request(&VALID.replace("GET", "POST")));
        assert_eq!(response.status(), 400);

        let text = std::str::from_utf8(&response.to_wire()).unwrap().to_string();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn http10_gets_400() {
        let response = handshake_response(&request(&VALID.replace("HTTP/1.1", "HTTP/1.0")));
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn missing_key_gets_400() {
        let text = VALID.replace("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", "");
        assert_eq!(handshake_response(&request(&text)).status(), 400);
    }

    #[test]
    fn upgrade_value_is_case_sensitive() {
        let text = VALID.replace("Upgrade: websocket", "Upgrade: WebSocket");
        assert_eq!(handshake_response(&request(&text)).status(), 400);
    }

    #[test]
    fn connection_substring_is_case_sensitive() {
        let text = VALID.replace("Connection: Upgrade", "Connection: keep-alive, upgrade");
        assert_eq!(handshake_response(&request(&text)).status(), 400);
    }

    #[test]
    fn missing_origin_gets_403() {
        let text = VALID.replace("Origin: http://example.com\r\n", "");
        let response = handshake_response(&request(&text));
        assert_eq!(response.status(), 403);
        assert!(std::str::from_utf8(&response.to_wire())
            .unwrap()
            .starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let text = VALID
            .replace("Sec-WebSocket-Key", "sec-websocket-key")
            .replace("Origin", "origin");
        assert_eq!(handshake_response(&request(&text)).status(), 101);
    }

    #[test]
    fn incremental_parse_across_chunks() {
        let mut parser = RequestParser::new();
        let (a, b) = VALID.as_bytes().split_at(27);

        parser.parse(a).unwrap();
        assert!(parser.is_empty());

        parser.parse(b).unwrap();
        let request = parser.pop().unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.protocol(), "HTTP/1.1");
        assert_eq!(
            request.header_value("Sec-WebSocket-Key"),
            Some("dGhlIHNhbXBsZSBub25jZQ==")
        );
    }

    #[test]
    fn pipelined_requests_both_queue() {
        let mut parser = RequestParser::new();
        let two = format!("{VALID}{VALID}");
        parser.parse(two.as_bytes()).unwrap();

        assert!(parser.pop().is_some());
        assert!(parser.front().is_some());
        assert!(parser.pop().is_some());
        assert!(parser.is_empty());
    }

    #[test]
    fn oversized_head_rejected() {
        let mut parser = RequestParser::new();
        let huge = vec![b'a'; MAX_HEADER_SIZE + 1];
        assert!(parser.parse(&huge).is_err());
    }
}
