//! The client worker: one task that owns the connection state.
//!
//! Every transition, frame and keepalive tick for a client runs here, one at
//! a time. The handle talks to the worker over a command channel; state is
//! published through a watch channel and events through ordered mpsc queues.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::observer::Event;
use crate::config::Config;
use crate::connection::bootstrap::{self, BoxedTransport, Dialer, Endpoint};
use crate::connection::engine::{CloseCause, EngineEvent, ProtocolEngine, WriteReply};
use crate::connection::{ConnectionState, DisconnectReason};
use crate::error::{Error, Result};
use crate::message::{CloseCode, Message};
use crate::protocol::Frame;
use crate::signal::{LifecycleEvent, ReachabilityEvent, SignalStream};

/// Upper bound for flushing our close frame while tearing down.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type Engine = ProtocolEngine<BoxedTransport>;
type PendingConnect = Pin<Box<dyn Future<Output = Result<Engine>> + Send>>;

/// Requests from the handle to the worker.
pub(crate) enum Command {
    Start,
    Stop,
    Send { message: Message, reply: WriteReply },
    Subscribe(mpsc::UnboundedSender<Event>),
    Shutdown,
}

/// Environment signal streams a client listens to.
#[derive(Default)]
pub(crate) struct Signals {
    pub(crate) reachability: Option<SignalStream<ReachabilityEvent>>,
    pub(crate) lifecycle: Option<SignalStream<LifecycleEvent>>,
}

pub(crate) struct Machine {
    endpoint: Endpoint,
    config: Config,
    dialer: Arc<dyn Dialer>,
    state: watch::Sender<ConnectionState>,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    started: bool,
    /// Last reported reachability; `None` until the first report.
    reachable: Option<bool>,
    engine: Option<Engine>,
    pending: Option<PendingConnect>,
    /// Connect requests that arrived while an attempt was in flight.
    queued_connects: usize,
}

impl Machine {
    pub(crate) fn new(
        endpoint: Endpoint,
        config: Config,
        dialer: Arc<dyn Dialer>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            endpoint,
            config,
            dialer,
            state,
            subscribers: Vec::new(),
            started: false,
            reachable: None,
            engine: None,
            pending: None,
            queued_connects: 0,
        }
    }

    /// Run until shutdown is requested or the handle is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, signals: Signals) {
        let Signals {
            mut reachability,
            mut lifecycle,
        } = signals;

        loop {
            let deadline = self.engine.as_ref().and_then(ProtocolEngine::next_deadline);

            // Commands first so that stop() wins over a connect that completes
            // in the same turn.
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                event = next_signal(&mut reachability) => match event {
                    Some(event) => self.on_reachability(event),
                    None => reachability = None,
                },
                event = next_signal(&mut lifecycle) => match event {
                    Some(event) => self.on_lifecycle(event),
                    None => lifecycle = None,
                },
                outcome = await_pending(&mut self.pending), if self.pending.is_some() => {
                    self.pending = None;
                    self.on_connect_outcome(outcome);
                }
                read = read_engine(&mut self.engine), if self.engine.is_some() => {
                    self.on_read(read);
                }
                () = sleep_until(deadline), if deadline.is_some() => {
                    self.on_deadline();
                }
            }
        }

        self.teardown().await;
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                if !self.started {
                    debug!("start");
                    self.started = true;
                    self.request_connect();
                }
            }
            Command::Stop => {
                if self.started {
                    debug!("stop");
                }
                self.started = false;
                self.force_disconnect(DisconnectReason::ExplicitStop);
            }
            Command::Send { message, reply } => self.send(message, reply),
            Command::Subscribe(tx) => self.subscribers.push(tx),
            Command::Shutdown => {}
        }
    }

    /// Queue `message` on the live connection; the writer answers `reply`.
    fn send(&mut self, message: Message, reply: WriteReply) {
        if let Err(e) = self.state.borrow().send_guard() {
            let _ = reply.send(Err(e.into()));
            return;
        }
        match self.engine.as_mut() {
            Some(engine) => engine.send(message, reply),
            None => {
                let _ = reply.send(Err(Error::ConnectionClosed(None)));
            }
        }
    }

    fn on_reachability(&mut self, event: ReachabilityEvent) {
        debug!(?event, "reachability");
        match event {
            ReachabilityEvent::ReachabilityChanged(true) => {
                self.reachable = Some(true);
                self.request_connect();
            }
            ReachabilityEvent::ReachabilityChanged(false) => {
                self.reachable = Some(false);
                if self.started {
                    self.force_disconnect(DisconnectReason::NetworkNotReachable);
                }
            }
            ReachabilityEvent::ConnectionTypeChanged => {
                if self.is_active() {
                    self.force_disconnect(DisconnectReason::NetworkNotReachable);
                    self.retry();
                }
            }
        }
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent) {
        debug!(?event, "lifecycle");
        if event == LifecycleEvent::ForegroundAfterExpiredBackground && self.is_active() {
            self.force_disconnect(DisconnectReason::AppBackgrounded);
            self.retry();
        }
    }

    fn on_connect_outcome(&mut self, outcome: Result<Engine>) {
        match outcome {
            Ok(engine) => {
                debug!("connected");
                self.engine = Some(engine);
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.set_state(ConnectionState::Disconnected(DisconnectReason::HandshakeFailed(
                    e.to_string(),
                )));
            }
        }

        while self.queued_connects > 0 && self.pending.is_none() {
            self.queued_connects -= 1;
            self.request_connect();
        }
    }

    fn on_read(&mut self, read: Result<Frame>) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if let Some(event) = engine.handle_read(read) {
            self.on_engine_event(event);
        }
    }

    fn on_deadline(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if let Some(event) = engine.on_deadline() {
            self.on_engine_event(event);
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Text(text) => self.notify(Event::Text(text)),
            EngineEvent::Binary(data) => self.notify(Event::Binary(data)),
            EngineEvent::Closed { code, cause } => {
                self.engine = None;
                if !self.state.borrow().is_connected() {
                    // Already reported when the close was started.
                    trace!(code = code.as_u16(), ?cause, "closing connection finished");
                    return;
                }
                match cause {
                    CloseCause::Local => trace!(code = code.as_u16(), "close handshake finished"),
                    CloseCause::Protocol(e) => {
                        warn!(error = %e, code = code.as_u16(), "closed on protocol error");
                        self.set_state(ConnectionState::Disconnected(DisconnectReason::ProtocolError));
                    }
                    CloseCause::Peer | CloseCause::Transport(_) | CloseCause::KeepAlive => {
                        debug!(code = code.as_u16(), ?cause, "connection lost");
                        self.set_state(ConnectionState::Disconnected(
                            DisconnectReason::UnexpectedServerError,
                        ));
                        self.retry();
                    }
                }
            }
        }
    }

    /// Connected, or a connect attempt in flight.
    fn is_active(&self) -> bool {
        matches!(
            *self.state.borrow(),
            ConnectionState::Connected | ConnectionState::Connecting
        )
    }

    /// Automatic reconnect, skipped while the network is known to be down.
    fn retry(&mut self) {
        if self.reachable == Some(false) {
            debug!("network unreachable, waiting before reconnecting");
            return;
        }
        self.request_connect();
    }

    /// Begin a connect attempt if started and disconnected.
    ///
    /// A request made while an attempt is in flight is queued and evaluated
    /// again once that attempt completes.
    fn request_connect(&mut self) {
        if !self.started {
            return;
        }
        if self.pending.is_some() {
            self.queued_connects += 1;
            return;
        }
        if !matches!(*self.state.borrow(), ConnectionState::Disconnected(_)) {
            return;
        }

        // A connection still finishing its close handshake is abandoned.
        self.engine = None;

        debug!(host = %self.endpoint.host, port = self.endpoint.port, "connecting");
        self.set_state(ConnectionState::Connecting);
        let endpoint = self.endpoint.clone();
        let config = self.config.clone();
        let dialer = Arc::clone(&self.dialer);
        self.pending = Some(Box::pin(async move {
            bootstrap::connect(&endpoint, &config, dialer.as_ref()).await
        }));
    }

    /// Cancel any attempt, start closing the engine and move to `Disconnected(reason)`.
    ///
    /// The engine stays installed until the server confirms the close.
    fn force_disconnect(&mut self, reason: DisconnectReason) {
        if self.pending.take().is_some() {
            debug!("connect attempt cancelled");
        }
        self.queued_connects = 0;

        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.close(CloseCode::Normal, "") {
                trace!(error = %e, "close frame not sent");
                self.engine = None;
            }
        }

        if matches!(reason, DisconnectReason::ExplicitStop)
            || !matches!(
                *self.state.borrow(),
                ConnectionState::Disconnected(DisconnectReason::NotStarted)
                    | ConnectionState::Disconnected(DisconnectReason::ExplicitStop)
            )
        {
            self.set_state(ConnectionState::Disconnected(reason));
        }
    }

    async fn teardown(&mut self) {
        debug!("shutting down");
        self.started = false;
        self.pending = None;
        self.queued_connects = 0;
        if let Some(mut engine) = self.engine.take() {
            let _ = engine.close(CloseCode::GoingAway, "");
            if tokio::time::timeout(TEARDOWN_TIMEOUT, engine.finish()).await.is_err() {
                trace!("close frame not flushed before teardown");
            }
        }
        self.set_state(ConnectionState::Disconnected(DisconnectReason::ExplicitStop));
    }

    fn set_state(&mut self, next: ConnectionState) {
        if *self.state.borrow() == next {
            return;
        }
        debug!(state = %next, "state changed");
        self.state.send_replace(next.clone());
        self.notify(Event::StateChanged(next));
    }

    fn notify(&mut self, event: Event) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

async fn next_signal<T>(stream: &mut Option<SignalStream<T>>) -> Option<T> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn await_pending(pending: &mut Option<PendingConnect>) -> Result<Engine> {
    match pending {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

async fn read_engine(engine: &mut Option<Engine>) -> Result<Frame> {
    match engine {
        Some(engine) => engine.read_frame().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
