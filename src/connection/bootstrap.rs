//! Opening a connection: TCP, optional TLS, then the HTTP Upgrade exchange.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::codec::WebSocketCodec;
use crate::config::Config;
use crate::connection::engine::ProtocolEngine;
use crate::error::{Error, Result};
use crate::protocol::handshake::{HandshakeRequest, HandshakeResponse, find_head_end};

/// A byte stream a WebSocket can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Type-erased transport produced by a [`Dialer`].
pub type BoxedTransport = Box<dyn Transport>;

/// Where a client connects to, derived from a `ws://` or `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `true` for `wss://`.
    pub secure: bool,
    /// Host name or address literal, without brackets.
    pub host: String,
    /// TCP port, defaulted from the scheme.
    pub port: u16,
    /// Path plus query, as sent in the request line.
    pub resource: String,
}

impl Endpoint {
    /// Parse a WebSocket URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` if the URL does not parse, its scheme is
    /// not `ws`/`wss`, or it has no host.
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(Error::InvalidUrl(format!("unsupported scheme: {other}")));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl("missing host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });

        let mut resource = url.path().to_string();
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        Ok(Self {
            secure,
            host,
            port,
            resource,
        })
    }

    /// Value for the `Host` header; the port is omitted when it is the default.
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// Opens the raw transport for an endpoint.
///
/// The default [`TcpDialer`] connects over TCP and, for `wss://`, runs the TLS
/// handshake. Tests inject in-memory implementations.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a stream to `endpoint`, ready for the HTTP Upgrade request.
    async fn dial(&self, endpoint: &Endpoint, config: &Config) -> Result<BoxedTransport>;
}

/// TCP dialer with `TCP_NODELAY`, plus rustls for secure endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint, config: &Config) -> Result<BoxedTransport> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !endpoint.secure {
            return Ok(Box::new(tcp));
        }
        secure(tcp, endpoint, config).await
    }
}

#[cfg(feature = "tls-rustls")]
async fn secure(tcp: TcpStream, endpoint: &Endpoint, config: &Config) -> Result<BoxedTransport> {
    use crate::tls::{TlsConnector, client_config_with_webpki_roots};

    let client_config = match &config.tls {
        Some(tls) => tls.clone(),
        None => client_config_with_webpki_roots().map_err(|e| Error::Transport(e.to_string()))?,
    };
    let stream = TlsConnector::new(client_config)
        .connect(&endpoint.host, tcp)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls-rustls"))]
async fn secure(_tcp: TcpStream, _endpoint: &Endpoint, _config: &Config) -> Result<BoxedTransport> {
    Err(Error::Transport(
        "wss:// requires the tls-rustls feature".into(),
    ))
}

/// Dial `endpoint` and perform the upgrade, all within `config.connect_timeout`.
///
/// # Errors
///
/// - `Error::Timeout` if the deadline passes
/// - `Error::Transport` if the dial fails
/// - handshake errors from [`upgrade`]
pub async fn connect(
    endpoint: &Endpoint,
    config: &Config,
    dialer: &dyn Dialer,
) -> Result<ProtocolEngine<BoxedTransport>> {
    let attempt = async {
        let transport = dialer.dial(endpoint, config).await?;
        upgrade(transport, endpoint, config).await
    };
    tokio::time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| Error::Timeout(format!("connect to {} timed out", endpoint.host)))?
}

/// Send the Upgrade request over `io` and validate the response.
///
/// Bytes received after the response head are kept for the frame decoder. On
/// failure the stream is shut down before the error is returned.
///
/// # Errors
///
/// - `Error::HandshakeStatus` for a status other than 101
/// - `Error::InvalidHandshake` for a malformed or mismatching response
/// - `Error::HandshakeTooLarge` if the head exceeds the configured limit
/// - `Error::Transport` if the stream fails or closes early
pub async fn upgrade<T>(mut io: T, endpoint: &Endpoint, config: &Config) -> Result<ProtocolEngine<T>>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let request = HandshakeRequest::new(endpoint.host_header(), endpoint.resource.clone())
        .with_basic_auth(config.basic_auth.clone());

    match exchange(&mut io, &request, config).await {
        Ok(leftover) => {
            debug!(host = %endpoint.host, leftover = leftover.len(), "upgrade complete");
            let codec = WebSocketCodec::new(io, config).with_read_buf(&leftover);
            Ok(ProtocolEngine::new(codec, config))
        }
        Err(e) => {
            let _ = io.shutdown().await;
            Err(e)
        }
    }
}

async fn exchange<T>(io: &mut T, request: &HandshakeRequest, config: &Config) -> Result<Vec<u8>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    request.write(&mut buf)?;
    io.write_all(&buf)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    io.flush()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    buf.clear();
    let mut chunk = [0u8; 1024];
    let head_len = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        config.limits.check_handshake_size(buf.len())?;
        let n = io
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if n == 0 {
            return Err(Error::Transport(
                "connection closed during handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    config.limits.check_handshake_size(head_len)?;

    HandshakeResponse::parse(&buf[..head_len], request)?;
    Ok(buf.split_off(head_len))
}
