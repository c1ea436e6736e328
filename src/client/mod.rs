//! The resilient client: a handle, a worker task and event delivery.
//!
//! [`WebSocket`] is the application-facing handle. All connection state
//! lives in a single worker task that reacts, in order, to handle commands,
//! reachability and lifecycle signals, connect outcomes, inbound frames and
//! keepalive deadlines.
//!
//! ## State transitions
//!
//! | From | Trigger | To |
//! |------|---------|----|
//! | `Disconnected` | `start()`, network back, reconnect | `Connecting` |
//! | `Connecting` | upgrade succeeds | `Connected` |
//! | `Connecting` | dial or upgrade fails | `Disconnected(HandshakeFailed)` |
//! | any | `stop()` | `Disconnected(ExplicitStop)` |
//! | any (started) | network unreachable | `Disconnected(NetworkNotReachable)` |
//! | `Connected`/`Connecting` | interface changed | `Disconnected(NetworkNotReachable)`, then reconnect |
//! | `Connected`/`Connecting` | foreground after expired background | `Disconnected(AppBackgrounded)`, then reconnect |
//! | `Connected` | server close, transport loss, keepalive timeout | `Disconnected(UnexpectedServerError)`, then reconnect |
//! | `Connected` | server protocol violation | `Disconnected(ProtocolError)` |

mod handle;
mod machine;
mod observer;

pub use handle::{SendCompletion, WebSocket, WebSocketBuilder};
pub use observer::{Event, Observer};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::bootstrap::{BoxedTransport, Dialer, Endpoint};
    use crate::connection::{ConnectionState, DisconnectReason};
    use crate::error::{Error, Result, StateError};
    use crate::protocol::handshake::find_head_end;
    use crate::protocol::{Frame, OpCode, compute_accept_key};
    use crate::signal::{LifecycleEvent, ReachabilityEvent, signal_channel};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Echo,
        Reject,
        Hang,
        CloseAfterUpgrade,
        MaskedFrame,
        /// Answer the upgrade after a delay.
        SlowUpgrade,
        /// Complete the upgrade, then never read again.
        Stall,
    }

    /// Dials in-memory servers; each dial takes the next queued mode, then
    /// falls back to `Echo`. Every byte the servers read after the upgrade
    /// request is recorded.
    #[derive(Clone, Default)]
    struct FakeDialer {
        modes: Arc<Mutex<VecDeque<Mode>>>,
        dials: Arc<AtomicUsize>,
        received: Arc<Mutex<Vec<u8>>>,
    }

    impl FakeDialer {
        fn with_modes(modes: &[Mode]) -> Self {
            let dialer = Self::default();
            dialer.modes.lock().unwrap().extend(modes.iter().copied());
            dialer
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        /// Client frames the servers have received so far.
        fn received_frames(&self) -> Vec<Frame> {
            let bytes = self.received.lock().unwrap().clone();
            let mut frames = Vec::new();
            let mut rest = &bytes[..];
            while let Ok((frame, used)) = Frame::parse(rest) {
                frames.push(frame);
                rest = &rest[used..];
            }
            frames
        }

        /// Wait until at least `count` client frames have arrived.
        async fn wait_for_frames(&self, count: usize) -> Vec<Frame> {
            for _ in 0..100 {
                let frames = self.received_frames();
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {count} frames, got {:?}", self.received_frames());
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, _endpoint: &Endpoint, _config: &Config) -> Result<BoxedTransport> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let mode = self.modes.lock().unwrap().pop_front().unwrap_or(Mode::Echo);
            if mode == Mode::Hang {
                std::future::pending::<()>().await;
            }
            let capacity = if mode == Mode::Stall { 1024 } else { 1 << 16 };
            let (client, server) = duplex(capacity);
            tokio::spawn(serve(server, mode, Arc::clone(&self.received)));
            Ok(Box::new(client))
        }
    }

    async fn serve(mut io: DuplexStream, mode: Mode, received: Arc<Mutex<Vec<u8>>>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_len = loop {
            if let Some(len) = find_head_end(&buf) {
                break len;
            }
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
        buf.drain(..head_len);
        received.lock().unwrap().extend_from_slice(&buf);

        if mode == Mode::Reject {
            let _ = io
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await;
            return;
        }

        if mode == Mode::SlowUpgrade {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let key = head
            .lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap_or_default();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept_key(key)
        );
        if io.write_all(response.as_bytes()).await.is_err() {
            return;
        }

        match mode {
            Mode::CloseAfterUpgrade => {
                let _ = io.write_all(&Frame::close(Some(1001), "").encode(None)).await;
            }
            Mode::MaskedFrame => {
                let _ = io.write_all(&Frame::text("x").encode(Some([1, 2, 3, 4]))).await;
            }
            Mode::Stall => {
                // Hold the stream open without reading.
                std::future::pending::<()>().await;
            }
            _ => {}
        }

        loop {
            match Frame::parse(&buf) {
                Ok((frame, used)) => {
                    buf.drain(..used);
                    let reply = match frame.opcode {
                        OpCode::Text | OpCode::Binary => Frame::new(true, frame.opcode, frame.into_payload()),
                        OpCode::Ping => Frame::pong(frame.into_payload()),
                        OpCode::Close => {
                            let _ = io.write_all(&Frame::close(Some(1000), "").encode(None)).await;
                            return;
                        }
                        _ => continue,
                    };
                    if io.write_all(&reply.encode(None)).await.is_err() {
                        return;
                    }
                }
                Err(Error::IncompleteFrame { .. }) => match io.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        received.lock().unwrap().extend_from_slice(&chunk[..n]);
                        buf.extend_from_slice(&chunk[..n]);
                    }
                },
                Err(_) => return,
            }
        }
    }

    fn client(dialer: &FakeDialer) -> WebSocket {
        WebSocket::builder("ws://fake.test/socket")
            .with_dialer(dialer.clone())
            .build()
            .unwrap()
    }

    async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within 5s")
            .expect("event stream ended")
    }

    async fn next_state(events: &mut UnboundedReceiver<Event>) -> ConnectionState {
        loop {
            if let Event::StateChanged(state) = next_event(events).await {
                return state;
            }
        }
    }

    async fn assert_quiet(events: &mut UnboundedReceiver<Event>) {
        let extra = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(extra.is_err(), "unexpected event: {extra:?}");
    }

    async fn connected(ws: &WebSocket) -> UnboundedReceiver<Event> {
        let mut events = ws.subscribe();
        ws.start();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        events
    }

    #[tokio::test]
    async fn test_connect_and_echo() {
        let dialer = FakeDialer::default();
        let ws = client(&dialer);
        let mut events = connected(&ws).await;

        assert!(ws.state().is_connected());
        ws.send_text("ping-test").unwrap().await.unwrap();
        assert_eq!(next_event(&mut events).await, Event::Text("ping-test".into()));

        ws.send(vec![1, 2, 3]).unwrap().await.unwrap();
        assert_eq!(next_event(&mut events).await, Event::Binary(vec![1, 2, 3]));
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let ws = client(&FakeDialer::default());
        assert_eq!(ws.source(), "fake.test");
        assert_eq!(ws.state(), ConnectionState::Disconnected(DisconnectReason::NotStarted));
        assert_eq!(
            ws.send_text("early").unwrap_err(),
            Error::State(StateError::CouldNotConnect)
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dialer = FakeDialer::default();
        let ws = client(&dialer);
        let mut events = connected(&ws).await;
        ws.start();
        ws.start();
        assert_quiet(&mut events).await;
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn test_stop_wins_over_inflight_connect() {
        let dialer = FakeDialer::with_modes(&[Mode::Hang]);
        let ws = client(&dialer);
        let mut events = ws.subscribe();
        ws.start();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(
            ws.send_text("too soon").unwrap_err(),
            Error::State(StateError::Connecting)
        );

        ws.stop();
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::ExplicitStop)
        );
        assert_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_stop_closes_connection() {
        let ws = client(&FakeDialer::default());
        let mut events = connected(&ws).await;
        ws.stop();
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::ExplicitStop)
        );
        assert_eq!(
            ws.send_text("late").unwrap_err(),
            Error::State(StateError::CouldNotConnect)
        );
        assert_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_refused_send_after_stop_writes_nothing() {
        let dialer = FakeDialer::default();
        let ws = client(&dialer);
        let mut events = connected(&ws).await;
        ws.stop();
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::ExplicitStop)
        );
        assert_eq!(
            ws.send_text("late").unwrap_err(),
            Error::State(StateError::CouldNotConnect)
        );

        let frames = dialer.wait_for_frames(1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dialer.received_frames(), frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Close);
        assert_eq!(frames[0].payload(), &1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_refused_send_while_connecting_writes_nothing() {
        let dialer = FakeDialer::with_modes(&[Mode::SlowUpgrade]);
        let ws = client(&dialer);
        let mut events = ws.subscribe();
        ws.start();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(
            ws.send_text("early").unwrap_err(),
            Error::State(StateError::Connecting)
        );
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert!(dialer.received_frames().is_empty());

        ws.send_text("after").unwrap().await.unwrap();
        assert_eq!(next_event(&mut events).await, Event::Text("after".into()));
        let frames = dialer.received_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"after");
    }

    #[tokio::test]
    async fn test_stop_is_not_blocked_by_a_stalled_write() {
        let dialer = FakeDialer::with_modes(&[Mode::Stall]);
        let ws = client(&dialer);
        let mut events = connected(&ws).await;

        let completion = ws.send(vec![0u8; 64 * 1024]).unwrap();
        ws.stop();
        let state = tokio::time::timeout(Duration::from_secs(1), next_state(&mut events))
            .await
            .expect("stop waited for the blocked write");
        assert_eq!(state, ConnectionState::Disconnected(DisconnectReason::ExplicitStop));
        assert_eq!(ws.state(), ConnectionState::Disconnected(DisconnectReason::ExplicitStop));
        drop(completion);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_detects_a_peer_that_stopped_reading() {
        let dialer = FakeDialer::with_modes(&[Mode::Stall]);
        let ws = WebSocket::builder("ws://fake.test/socket")
            .with_dialer(dialer.clone())
            .with_config(Config::default().with_ping_interval(Duration::from_secs(1)))
            .build()
            .unwrap();
        let mut events = connected(&ws).await;

        let _completion = ws.send(vec![0u8; 64 * 1024]).unwrap();
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::UnexpectedServerError)
        );
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_handshake_rejection() {
        let dialer = FakeDialer::with_modes(&[Mode::Reject]);
        let ws = client(&dialer);
        let mut events = ws.subscribe();
        ws.start();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert!(matches!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::HandshakeFailed(_))
        ));
        assert_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_server_close_reconnects() {
        let dialer = FakeDialer::with_modes(&[Mode::CloseAfterUpgrade]);
        let ws = client(&dialer);
        let mut events = connected(&ws).await;
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::UnexpectedServerError)
        );
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_protocol_error_does_not_reconnect() {
        let dialer = FakeDialer::with_modes(&[Mode::MaskedFrame]);
        let ws = client(&dialer);
        let mut events = connected(&ws).await;
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::ProtocolError)
        );
        assert_quiet(&mut events).await;
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_network_suspends_reconnects() {
        let dialer = FakeDialer::default();
        let (reachability, stream) = signal_channel();
        let ws = WebSocket::builder("ws://fake.test/socket")
            .with_dialer(dialer.clone())
            .with_reachability(stream)
            .build()
            .unwrap();
        let mut events = connected(&ws).await;

        reachability.send(ReachabilityEvent::ReachabilityChanged(false));
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::NetworkNotReachable)
        );
        reachability.send(ReachabilityEvent::ReachabilityChanged(false));
        assert_quiet(&mut events).await;
        assert_eq!(dialer.dials(), 1);

        reachability.send(ReachabilityEvent::ReachabilityChanged(true));
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_before_start_is_silent() {
        let (reachability, stream) = signal_channel();
        let ws = WebSocket::builder("ws://fake.test/socket")
            .with_dialer(FakeDialer::default())
            .with_reachability(stream)
            .build()
            .unwrap();
        let mut events = ws.subscribe();
        reachability.send(ReachabilityEvent::ReachabilityChanged(false));
        reachability.send(ReachabilityEvent::ReachabilityChanged(true));
        assert_quiet(&mut events).await;
        assert_eq!(ws.state(), ConnectionState::Disconnected(DisconnectReason::NotStarted));
    }

    #[tokio::test]
    async fn test_connection_type_change_reconnects() {
        let dialer = FakeDialer::default();
        let (reachability, stream) = signal_channel();
        let ws = WebSocket::builder("ws://fake.test/socket")
            .with_dialer(dialer.clone())
            .with_reachability(stream)
            .build()
            .unwrap();
        let mut events = connected(&ws).await;

        reachability.send(ReachabilityEvent::ConnectionTypeChanged);
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::NetworkNotReachable)
        );
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_expired_background_reconnects() {
        let dialer = FakeDialer::default();
        let (lifecycle, stream) = signal_channel();
        let ws = WebSocket::builder("ws://fake.test/socket")
            .with_dialer(dialer.clone())
            .with_lifecycle(stream)
            .build()
            .unwrap();
        let mut events = connected(&ws).await;

        lifecycle.send(LifecycleEvent::EnteredBackground);
        lifecycle.send(LifecycleEvent::ForegroundAfterExpiredBackground);
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::AppBackgrounded)
        );
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_shutdown_reports_explicit_stop() {
        let ws = client(&FakeDialer::default());
        let mut events = connected(&ws).await;
        let state = ws.watch_state();
        ws.shutdown().await;
        assert_eq!(
            *state.borrow(),
            ConnectionState::Disconnected(DisconnectReason::ExplicitStop)
        );
        assert_eq!(
            next_state(&mut events).await,
            ConnectionState::Disconnected(DisconnectReason::ExplicitStop)
        );
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let err = WebSocket::builder("http://fake.test/").build().unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }
}
