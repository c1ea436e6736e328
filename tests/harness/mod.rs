//! Test harness: an in-process WebSocket echo server.
//!
//! The server speaks just enough RFC 6455 to exercise the client: it answers
//! the upgrade, echoes data frames, answers pings and close frames, and can
//! drop every connection on demand to simulate server loss.

mod server;

#[allow(unused_imports)]
pub use server::{ServerOptions, TestServer, serve_connection};
