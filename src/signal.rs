//! Environment signals consumed by the client.
//!
//! A client listens to two streams: network reachability and app lifecycle.
//! Platforms feed them through [`signal_channel`] or the two monitors below,
//! which turn raw OS notifications into the events the client acts on.

use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Reachability change delivered to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReachabilityEvent {
    /// The network became reachable (`true`) or unreachable (`false`).
    ReachabilityChanged(bool),
    /// The network stayed reachable but moved to another interface.
    ConnectionTypeChanged,
}

/// App lifecycle change delivered to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The app moved to the background.
    EnteredBackground,
    /// The app returned after the background grace period ran out, so any
    /// connection kept across the suspension is presumed dead.
    ForegroundAfterExpiredBackground,
}

/// Boxed stream of environment signals.
pub type SignalStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Sending half of a [`signal_channel`].
#[derive(Debug)]
pub struct SignalSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for SignalSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> SignalSender<T> {
    /// Deliver a signal. Returns `false` once the stream has been dropped.
    pub fn send(&self, event: T) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Create a signal source and the stream a client consumes.
///
/// The stream ends when every sender is dropped.
#[must_use]
pub fn signal_channel<T: Send + 'static>() -> (SignalSender<T>, SignalStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    });
    (SignalSender { tx }, Box::pin(stream))
}

/// Network interface class reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Other,
}

/// Raw reachability status reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    NotReachable,
    Reachable(ConnectionType),
}

/// Turns raw [`NetworkStatus`] updates into [`ReachabilityEvent`]s.
///
/// Reachability changes are de-duplicated. A type change is reported only
/// when two consecutive reachable statuses carry different types; losing the
/// network forgets the last type.
#[derive(Debug)]
pub struct ReachabilityMonitor {
    is_reachable: bool,
    last_type: Option<ConnectionType>,
    sender: SignalSender<ReachabilityEvent>,
}

impl ReachabilityMonitor {
    /// Create a monitor with the platform's current reachability.
    #[must_use]
    pub fn new(initially_reachable: bool) -> (Self, SignalStream<ReachabilityEvent>) {
        let (sender, stream) = signal_channel();
        let monitor = Self {
            is_reachable: initially_reachable,
            last_type: None,
            sender,
        };
        (monitor, stream)
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.is_reachable
    }

    /// Feed one platform status update.
    pub fn update(&mut self, status: NetworkStatus) {
        trace!(?status, "network status");
        match status {
            NetworkStatus::Reachable(connection_type) => {
                self.set_reachable(true);
                if self.last_type.is_some_and(|last| last != connection_type) {
                    self.sender.send(ReachabilityEvent::ConnectionTypeChanged);
                }
                self.last_type = Some(connection_type);
            }
            NetworkStatus::NotReachable => {
                self.set_reachable(false);
                self.last_type = None;
            }
        }
    }

    fn set_reachable(&mut self, reachable: bool) {
        if self.is_reachable != reachable {
            self.is_reachable = reachable;
            self.sender.send(ReachabilityEvent::ReachabilityChanged(reachable));
        }
    }
}

/// How long an app may stay in the background before its connection is
/// presumed dead.
pub const DEFAULT_BACKGROUND_GRACE: Duration = Duration::from_secs(30);

/// Turns background/foreground notifications into [`LifecycleEvent`]s.
#[derive(Debug)]
pub struct BackgroundMonitor {
    grace: Duration,
    entered_at: Option<Instant>,
    sender: SignalSender<LifecycleEvent>,
}

impl BackgroundMonitor {
    #[must_use]
    pub fn new(grace: Duration) -> (Self, SignalStream<LifecycleEvent>) {
        let (sender, stream) = signal_channel();
        let monitor = Self {
            grace,
            entered_at: None,
            sender,
        };
        (monitor, stream)
    }

    pub fn entered_background(&mut self) {
        self.entered_at = Some(Instant::now());
        self.sender.send(LifecycleEvent::EnteredBackground);
    }

    /// Report the return to the foreground.
    ///
    /// Emits `ForegroundAfterExpiredBackground` only when the grace period has
    /// run out since the last `entered_background`.
    pub fn entered_foreground(&mut self) {
        if let Some(entered_at) = self.entered_at.take() {
            if entered_at.elapsed() >= self.grace {
                self.sender.send(LifecycleEvent::ForegroundAfterExpiredBackground);
            }
        }
    }
}

impl Default for BackgroundMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_BACKGROUND_GRACE).0
    }
}
