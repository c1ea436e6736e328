//! WebSocket echo server for integration testing.
//!
//! Spawns on a random local port and tracks accepted connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use wstether::protocol::handshake::find_head_end;
use wstether::{Error, Frame, OpCode, compute_accept_key};

/// Behaviour knobs for a [`TestServer`].
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Reject upgrades whose `Authorization` header differs.
    pub expected_auth: Option<String>,
    /// Never answer pings.
    pub ignore_pings: bool,
}

#[derive(Debug, Default)]
struct Shared {
    accepted: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    kill: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(ServerOptions::default()).await
    }

    pub async fn spawn_with(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        let (kill, _) = broadcast::channel(4);

        let handle = {
            let shared = shared.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    shared.accepted.fetch_add(1, Ordering::SeqCst);
                    let shared = shared.clone();
                    let options = options.clone();
                    let mut kill = kill.subscribe();
                    tokio::spawn(async move {
                        tokio::select! {
                            head = serve_connection(stream, &options) => {
                                if let Some(head) = head {
                                    shared.requests.lock().unwrap().push(head);
                                }
                            }
                            _ = kill.recv() => {}
                        }
                    });
                }
            })
        };

        Self {
            addr,
            shared,
            kill,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Request heads of connections that have finished.
    pub fn requests(&self) -> Vec<String> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Drop every open connection without a close frame.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    pub async fn shutdown(self) {
        self.kill_connections();
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Serve one connection: upgrade, then echo until the client closes.
///
/// Returns the request head once the connection ends.
pub async fn serve_connection<S>(mut io: S, options: &ServerOptions) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_len = loop {
        if let Some(len) = find_head_end(&buf) {
            break len;
        }
        match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
    buf.drain(..head_len);

    let header = |name: &str| {
        head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    };

    if let Some(expected) = &options.expected_auth {
        if header("authorization").as_deref() != Some(expected.as_str()) {
            let _ = io
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await;
            return Some(head);
        }
    }

    let key = header("sec-websocket-key").unwrap_or_default();
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(&key)
    );
    if io.write_all(response.as_bytes()).await.is_err() {
        return Some(head);
    }

    loop {
        match Frame::parse(&buf) {
            Ok((frame, used)) => {
                buf.drain(..used);
                assert!(frame.mask_key.is_some(), "client frames must be masked");
                let reply = match frame.opcode {
                    OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                        Frame::new(frame.fin, frame.opcode, frame.into_payload())
                    }
                    OpCode::Ping if options.ignore_pings => continue,
                    OpCode::Ping => Frame::pong(frame.into_payload()),
                    OpCode::Pong => continue,
                    OpCode::Close => {
                        let _ = io.write_all(&Frame::close(Some(1000), "").encode(None)).await;
                        let _ = io.shutdown().await;
                        return Some(head);
                    }
                };
                if io.write_all(&reply.encode(None)).await.is_err() {
                    return Some(head);
                }
            }
            Err(Error::IncompleteFrame { .. }) => match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return Some(head),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            },
            Err(_) => return Some(head),
        }
    }
}
