use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::client::machine::{Command, Machine, Signals};
use crate::client::observer::{self, Event, Observer};
use crate::config::Config;
use crate::connection::bootstrap::{Dialer, Endpoint, TcpDialer};
use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::signal::{LifecycleEvent, ReachabilityEvent, SignalStream};

/// A resilient WebSocket client.
///
/// The client owns a background task that connects, reconnects after
/// unexpected loss, and reacts to reachability and lifecycle signals. The
/// handle is cheap to query and never blocks on network I/O.
///
/// Dropping the handle stops the client and closes the connection.
///
/// # Example
///
/// ```rust,no_run
/// use wstether::{Event, WebSocket};
///
/// # async fn run() -> wstether::Result<()> {
/// let ws = WebSocket::builder("ws://127.0.0.1:9001/echo").build()?;
/// let mut events = ws.subscribe();
/// ws.start();
///
/// while let Some(event) = events.recv().await {
///     if let Event::StateChanged(state) = event {
///         if state.is_connected() {
///             ws.send_text("hello")?.await?;
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct WebSocket {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    source: String,
    worker: Option<JoinHandle<()>>,
}

impl WebSocket {
    /// Start configuring a client for `url` (`ws://` or `wss://`).
    pub fn builder(url: impl Into<String>) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    /// Begin connecting. Idempotent.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Close the connection and stay disconnected until the next `start`.
    ///
    /// Takes precedence over any connect attempt in flight.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every published state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Host of the URL this client connects to.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Send a binary message.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`StateError::Connecting`] while a connection
    /// is being established (or the app is backgrounded) and with
    /// [`StateError::CouldNotConnect`] otherwise when not connected. The
    /// returned future resolves once the frame is written.
    ///
    /// [`StateError::Connecting`]: crate::StateError::Connecting
    /// [`StateError::CouldNotConnect`]: crate::StateError::CouldNotConnect
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<SendCompletion> {
        self.dispatch(Message::binary(data))
    }

    /// Send a text message. Fails like [`send`](Self::send).
    pub fn send_text(&self, text: impl Into<String>) -> Result<SendCompletion> {
        self.dispatch(Message::text(text))
    }

    /// Send a ping. The payload must fit in a control frame.
    pub fn send_ping(&self, data: impl Into<Vec<u8>>) -> Result<SendCompletion> {
        self.dispatch(Message::ping(data))
    }

    /// Send an unsolicited pong.
    pub fn send_pong(&self, data: impl Into<Vec<u8>>) -> Result<SendCompletion> {
        self.dispatch(Message::pong(data))
    }

    fn dispatch(&self, message: Message) -> Result<SendCompletion> {
        self.state.borrow().send_guard()?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { message, reply })
            .map_err(|_| Error::ConnectionClosed(None))?;
        Ok(SendCompletion { rx })
    }

    /// Receive every event from now on, in order.
    ///
    /// The receiver ends when the client shuts down.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Subscribe(tx));
        rx
    }

    /// Deliver events to `observer` on a dedicated task.
    pub fn set_observer(&self, observer: Arc<dyn Observer>) {
        let events = self.subscribe();
        tokio::spawn(observer::notify(observer, events));
    }

    /// Stop the client, close the connection and wait for the worker to exit.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("source", &self.source)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Resolves when a message handed to [`WebSocket::send`] has been written.
#[derive(Debug)]
#[must_use = "the send may still fail; await the completion to find out"]
pub struct SendCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for SendCompletion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(Error::ConnectionClosed(None))))
    }
}

/// Configures and spawns a [`WebSocket`].
pub struct WebSocketBuilder {
    url: String,
    config: Config,
    dialer: Arc<dyn Dialer>,
    signals: Signals,
}

impl WebSocketBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: Config::default(),
            dialer: Arc::new(TcpDialer),
            signals: Signals::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replace how transports are opened.
    #[must_use]
    pub fn with_dialer(mut self, dialer: impl Dialer) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Listen to network reachability changes.
    #[must_use]
    pub fn with_reachability(mut self, events: SignalStream<ReachabilityEvent>) -> Self {
        self.signals.reachability = Some(events);
        self
    }

    /// Listen to app lifecycle changes.
    #[must_use]
    pub fn with_lifecycle(mut self, events: SignalStream<LifecycleEvent>) -> Self {
        self.signals.lifecycle = Some(events);
        self
    }

    /// Validate the URL and spawn the client task. The client starts idle.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` if the URL is not a usable `ws`/`wss` URL.
    pub fn build(self) -> Result<WebSocket> {
        let endpoint = Endpoint::parse(&self.url)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let source = endpoint.host.clone();
        let span = tracing::info_span!("websocket", host = %endpoint.host, port = endpoint.port);
        let machine = Machine::new(endpoint, self.config, self.dialer, state_tx);
        let worker = tokio::spawn(machine.run(commands_rx, self.signals).instrument(span));

        Ok(WebSocket {
            commands,
            state: state_rx,
            source,
            worker: Some(worker),
        })
    }
}

impl std::fmt::Debug for WebSocketBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketBuilder")
            .field("url", &self.url)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
