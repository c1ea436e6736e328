//! Connection building blocks: state, keepalive, the frame engine and
//! transport bootstrap.
//!
//! A connection is opened by [`bootstrap::connect`], which dials a transport
//! through a [`Dialer`], performs the HTTP Upgrade and returns a
//! [`ProtocolEngine`]. The engine then owns frame I/O until it reports
//! [`EngineEvent::Closed`]. Writes are queued to a per-connection writer
//! task and confirmed through a oneshot reply.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wstether::connection::{Endpoint, EngineEvent, TcpDialer, connect};
//! use wstether::{Config, Message};
//!
//! # async fn run() -> wstether::Result<()> {
//! let endpoint = Endpoint::parse("ws://127.0.0.1:9001/")?;
//! let mut engine = connect(&endpoint, &Config::default(), &TcpDialer).await?;
//! let (reply, written) = tokio::sync::oneshot::channel();
//! engine.send(Message::text("hello"), reply);
//! written.await.map_err(|_| wstether::Error::ConnectionClosed(None))??;
//! loop {
//!     let read = engine.read_frame().await;
//!     if let Some(EngineEvent::Text(text)) = engine.handle_read(read) {
//!         println!("{text}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod engine;
mod keepalive;
mod state;

pub use bootstrap::{BoxedTransport, Dialer, Endpoint, TcpDialer, Transport, connect, upgrade};
pub use engine::{CLOSE_TIMEOUT, CloseCause, EngineEvent, ProtocolEngine, WriteReply};
pub use keepalive::{KeepAliveAction, KeepAliveTimer};
pub use state::{ConnectionState, DisconnectReason};
