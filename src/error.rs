//! Error types for the WebSocket client.
//!
//! Every failure in this crate is one of the variants of [`Error`]. Variants are
//! grouped into the families reported by [`Error::kind`]: transport, handshake,
//! protocol, state and timeout. Transport and handshake failures never reach the
//! caller's steady-state API; they surface as a `Disconnected` state transition.

use thiserror::Error;

use crate::message::CloseCode;

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a send was refused because the connection is not established.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateError {
    /// A connection attempt is in progress, or expected to start shortly.
    #[error("connection is being established")]
    Connecting,
    /// The connection is down and no attempt is pending.
    #[error("could not connect")]
    CouldNotConnect,
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// TCP or TLS level failure.
    Transport,
    /// Malformed or non-101 upgrade response.
    Handshake,
    /// Peer violated RFC 6455 framing rules.
    Protocol,
    /// Operation not allowed in the current connection state.
    State,
    /// A liveness or connect deadline expired.
    Timeout,
}

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid frame structure or header.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// 64-bit payload length with the most significant bit set.
    #[error("Invalid frame length: {0:#x}")]
    InvalidFrameLength(u64),

    /// Protocol violation detected.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid UTF-8 in text message.
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Frame size exceeds configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Message size exceeds configured maximum.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many fragments in a single message.
    #[error("Too many fragments: {count} (max: {max})")]
    TooManyFragments {
        /// Actual fragment count.
        count: usize,
        /// Maximum allowed fragments.
        max: usize,
    },

    /// Payload length does not fit in memory on this platform.
    #[error("Payload too large for platform: {size} bytes")]
    PayloadTooLargeForPlatform {
        /// Length announced by the frame header.
        size: u64,
    },

    /// Connection has been closed.
    #[error("Connection closed: {0:?}")]
    ConnectionClosed(Option<u16>),

    /// The upgrade response was malformed or did not match the request.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The server answered the upgrade request with a status other than 101.
    #[error("Unexpected handshake status: {0}")]
    HandshakeStatus(u16),

    /// Handshake data exceeds configured maximum.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Bytes received so far.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A header value would break the HTTP request framing.
    #[error("Invalid value for header {header}: {reason}")]
    InvalidHeaderValue {
        /// Header name.
        header: String,
        /// What is wrong with the value.
        reason: String,
    },

    /// The target URL cannot be used for a WebSocket connection.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// TCP or TLS level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error occurred on an established connection.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid close code.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame fragmented (RFC violation).
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload too large (>125 bytes).
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Masked server frame (security violation).
    #[error("Server frame must not be masked")]
    MaskedServerFrame,

    /// Reserved bits set without extension.
    #[error("Reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Incomplete frame data.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },

    /// Invalid opcode value.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Send attempted while not connected.
    #[error("Not connected: {0}")]
    State(#[from] StateError),

    /// A deadline expired (missed pong, connect timeout).
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Io(_) | Error::ConnectionClosed(_) => ErrorKind::Transport,
            Error::InvalidHandshake(_)
            | Error::HandshakeStatus(_)
            | Error::HandshakeTooLarge { .. }
            | Error::InvalidHeaderValue { .. }
            | Error::InvalidUrl(_) => ErrorKind::Handshake,
            Error::State(_) => ErrorKind::State,
            Error::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Protocol,
        }
    }

    /// Returns `true` if the peer broke the framing rules.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// Close code to send to the peer when this error ends the connection.
    ///
    /// Returns `None` for errors that are not caused by the peer's frames.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::FrameTooLarge { .. }
            | Error::MessageTooLarge { .. }
            | Error::TooManyFragments { .. }
            | Error::PayloadTooLargeForPlatform { .. }
            | Error::InvalidFrameLength(_) => Some(CloseCode::MessageTooBig),
            Error::InvalidUtf8 => Some(CloseCode::InvalidPayload),
            e if e.is_protocol() => Some(CloseCode::ProtocolError),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}
