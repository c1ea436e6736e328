//! WebSocket opening handshake, client side (RFC 6455 Section 4).
//!
//! This module builds the HTTP Upgrade request and validates the server's
//! answer. The I/O around it lives in the connection bootstrap.

use crate::config::BasicAuth;
use crate::error::{Error, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Parse HTTP headers from an iterator of lines into a case-insensitive HashMap.
///
/// Security-relevant headers that appear twice are rejected.
///
/// # Errors
/// Returns `Error::InvalidHandshake` if a security-critical header is duplicated.
fn parse_headers<'a, I>(lines: I) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = &'a str>,
{
    const SECURITY_HEADERS: [&str; 3] = ["upgrade", "connection", "sec-websocket-accept"];
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name_lower = name.trim().to_lowercase();

            if SECURITY_HEADERS.contains(&name_lower.as_str()) && headers.contains_key(&name_lower) {
                return Err(Error::InvalidHandshake(format!(
                    "Duplicate header: {}",
                    name.trim()
                )));
            }

            headers.insert(name_lower, value.trim().to_string());
        }
    }

    Ok(headers)
}

/// Validate that a header value does not contain CR or LF characters.
///
/// # Errors
/// Returns `Error::InvalidHeaderValue` if the value contains `\r` or `\n`.
fn validate_header_value(header_name: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::InvalidHeaderValue {
            header: header_name.to_string(),
            reason: "contains CR or LF characters".to_string(),
        });
    }
    Ok(())
}

/// Computes the Sec-WebSocket-Accept value from the client's Sec-WebSocket-Key.
///
/// The accept key is calculated as: Base64(SHA-1(key + GUID))
///
/// # Example
///
/// ```
/// use wstether::protocol::handshake::compute_accept_key;
///
/// let key = "dGhlIHNhbXBsZSBub25jZQ==";
/// let accept = compute_accept_key(key);
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    BASE64.encode(hash)
}

/// Generate a fresh `Sec-WebSocket-Key`: base64 of 16 random bytes.
#[must_use]
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    for chunk in nonce.chunks_exact_mut(4) {
        chunk.copy_from_slice(&crate::protocol::mask::generate_mask());
    }
    BASE64.encode(nonce)
}

/// Locate the end of the HTTP header block.
///
/// Returns the index just past the blank line, i.e. the length of the head.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Client upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// The request target, path plus query (e.g. "/chat?room=1").
    pub path: String,
    /// The Host header value, including a non-default port.
    pub host: String,
    /// The Sec-WebSocket-Key header value.
    pub key: String,
    /// Optional `Authorization: Basic` credentials.
    pub auth: Option<BasicAuth>,
}

impl HandshakeRequest {
    /// Build a request for `host` and `path` with a freshly generated key.
    #[must_use]
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path: if path.is_empty() { "/".to_string() } else { path },
            host: host.into(),
            key: generate_key(),
            auth: None,
        }
    }

    /// Attach Basic credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, auth: Option<BasicAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// The accept value a conforming server must answer with.
    #[must_use]
    pub fn expected_accept(&self) -> String {
        compute_accept_key(&self.key)
    }

    /// Write the HTTP request to a buffer.
    ///
    /// # Errors
    /// Returns `Error::InvalidHeaderValue` if the host, path or credentials
    /// contain CR/LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        validate_header_value("Host", &self.host)?;
        if self.path.contains(['\r', '\n', ' ']) {
            return Err(Error::InvalidHeaderValue {
                header: "Request-Target".to_string(),
                reason: "contains whitespace or line breaks".to_string(),
            });
        }

        buf.extend_from_slice(format!("GET {} HTTP/1.1\r\n", self.path).as_bytes());
        buf.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Key: {}\r\n", self.key).as_bytes());
        buf.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n");

        if let Some(auth) = &self.auth {
            let credentials = format!("{}:{}", auth.username, auth.password);
            validate_header_value("Authorization", &credentials)?;
            buf.extend_from_slice(
                format!("Authorization: Basic {}\r\n", BASE64.encode(credentials)).as_bytes(),
            );
        }

        buf.extend_from_slice(b"\r\n");
        Ok(())
    }
}

/// Validated server upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// The Sec-WebSocket-Accept value.
    pub accept: String,
    /// The selected Sec-WebSocket-Protocol (optional).
    pub protocol: Option<String>,
}

impl HandshakeResponse {
    /// Parse the server's response head and check it against `request`.
    ///
    /// # Errors
    ///
    /// - [`Error::HandshakeStatus`] if the status code is not 101.
    /// - [`Error::InvalidHandshake`] if the head is not UTF-8, the status line
    ///   is malformed, `Upgrade`/`Connection` are missing or wrong, or the
    ///   `Sec-WebSocket-Accept` value does not match the request key.
    pub fn parse(data: &[u8], request: &HandshakeRequest) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("Invalid UTF-8".into()))?;

        let mut lines = text.lines();

        // Status line: "HTTP/1.1 101 Switching Protocols"
        let status_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty response".into()))?;

        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid status line: {}",
                status_line
            )));
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| Error::InvalidHandshake(format!("Invalid status line: {}", status_line)))?;
        if status != 101 {
            return Err(Error::HandshakeStatus(status));
        }

        let headers = parse_headers(lines)?;

        let upgrade = headers
            .get("upgrade")
            .ok_or_else(|| Error::InvalidHandshake("Missing Upgrade header in response".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Upgrade header: {}",
                upgrade
            )));
        }

        let connection = headers.get("connection").ok_or_else(|| {
            Error::InvalidHandshake("Missing Connection header in response".into())
        })?;
        if !connection.to_lowercase().contains("upgrade") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Connection header: {}",
                connection
            )));
        }

        let accept = headers
            .get("sec-websocket-accept")
            .ok_or_else(|| Error::InvalidHandshake("Missing Sec-WebSocket-Accept header".into()))?
            .clone();
        if accept != request.expected_accept() {
            return Err(Error::InvalidHandshake(
                "Sec-WebSocket-Accept does not match key".into(),
            ));
        }

        Ok(Self {
            accept,
            protocol: headers.get("sec-websocket-protocol").cloned(),
        })
    }
}
