//! Client connection state as seen by the application.

use crate::error::StateError;

/// Why the client is not connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// `start()` has not been called yet.
    NotStarted,
    /// The network is unreachable, or its connection type just changed.
    NetworkNotReachable,
    /// The app came back after its background grace period expired.
    AppBackgrounded,
    /// The server closed the connection, the transport failed, or a pong was missed.
    UnexpectedServerError,
    /// The server violated RFC 6455 framing rules.
    ProtocolError,
    /// The application called `stop()`.
    ExplicitStop,
    /// The connect attempt or upgrade handshake failed.
    HandshakeFailed(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::NotStarted => write!(f, "not started"),
            DisconnectReason::NetworkNotReachable => write!(f, "network not reachable"),
            DisconnectReason::AppBackgrounded => write!(f, "app backgrounded"),
            DisconnectReason::UnexpectedServerError => write!(f, "unexpected server error"),
            DisconnectReason::ProtocolError => write!(f, "protocol error"),
            DisconnectReason::ExplicitStop => write!(f, "explicit stop"),
            DisconnectReason::HandshakeFailed(detail) => write!(f, "handshake failed: {detail}"),
        }
    }
}

/// Connection state of a client.
///
/// Exactly one value holds at any instant. Only the client's worker changes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A connect attempt is in flight.
    Connecting,
    /// The upgrade succeeded and messages can be sent.
    Connected,
    /// No connection, for the given reason.
    Disconnected(DisconnectReason),
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected(DisconnectReason::NotStarted)
    }
}

impl ConnectionState {
    /// Returns `true` only for `Connected`.
    #[must_use]
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check whether sending is allowed in this state.
    ///
    /// # Errors
    ///
    /// - `StateError::Connecting` while connecting, or after a backgrounding
    ///   disconnect that is about to reconnect
    /// - `StateError::CouldNotConnect` for every other disconnect reason
    pub fn send_guard(&self) -> Result<(), StateError> {
        match self {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting
            | ConnectionState::Disconnected(DisconnectReason::AppBackgrounded) => {
                Err(StateError::Connecting)
            }
            ConnectionState::Disconnected(_) => Err(StateError::CouldNotConnect),
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected(reason) => write!(f, "Disconnected({reason})"),
        }
    }
}
