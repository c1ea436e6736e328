//! # wstether - a WebSocket client that stays connected
//!
//! `wstether` is an RFC 6455 WebSocket client for long-lived connections on
//! devices whose network and lifecycle change underneath them.
//!
//! ## Features
//!
//! - **Connection state machine** with explicit disconnect reasons
//! - **Automatic reconnect** after server loss, interface changes and
//!   expired background suspension, paused while the network is unreachable
//! - **Strict client framing**: masked writes, validated reads, fragment
//!   reassembly, UTF-8 checks, ping/pong keepalive and the close handshake
//! - **TLS** for `wss://` via rustls (feature `tls-rustls`, on by default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wstether::{Config, Event, WebSocket};
//! use std::time::Duration;
//!
//! # async fn run() -> wstether::Result<()> {
//! let ws = WebSocket::builder("wss://echo.example.com/")
//!     .with_config(Config::default().with_ping_interval(Duration::from_secs(10)))
//!     .build()?;
//! let mut events = ws.subscribe();
//! ws.start();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::StateChanged(state) if state.is_connected() => {
//!             ws.send_text("hello")?.await?;
//!         }
//!         Event::Text(text) => println!("{text}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment signals
//!
//! Platforms report reachability and app lifecycle through
//! [`signal::ReachabilityMonitor`] and [`signal::BackgroundMonitor`] (or any
//! [`signal::SignalStream`]) passed to the builder.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod signal;

#[cfg(feature = "tls-rustls")]
pub mod tls;

pub use client::{Event, Observer, SendCompletion, WebSocket, WebSocketBuilder};
pub use codec::WebSocketCodec;
pub use config::{BasicAuth, Config, Limits};
pub use connection::{ConnectionState, DisconnectReason, Dialer, Endpoint, TcpDialer};
pub use error::{Error, ErrorKind, Result, StateError};
pub use message::{CloseCode, CloseFrame, Message};
pub use protocol::{Frame, HandshakeRequest, HandshakeResponse, OpCode, WS_GUID, compute_accept_key};
pub use signal::{LifecycleEvent, ReachabilityEvent, SignalSender, SignalStream, signal_channel};
