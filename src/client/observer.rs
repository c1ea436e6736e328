//! Notifications delivered to the application.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::ConnectionState;

/// One notification from a client, in the order the worker produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A complete text message arrived.
    Text(String),
    /// A complete binary message arrived.
    Binary(Vec<u8>),
}

/// Callback interface for client notifications.
///
/// Methods run on a dedicated notifier task, one at a time, never while the
/// client holds internal state. All methods default to doing nothing.
pub trait Observer: Send + Sync + 'static {
    fn on_state_changed(&self, _state: &ConnectionState) {}

    fn on_text(&self, _text: &str) {}

    fn on_binary(&self, _data: &[u8]) {}
}

/// Forward every event from `events` to `observer` until the client goes away.
pub(crate) async fn notify(observer: Arc<dyn Observer>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match &event {
            Event::StateChanged(state) => observer.on_state_changed(state),
            Event::Text(text) => observer.on_text(text),
            Event::Binary(data) => observer.on_binary(data),
        }
    }
}
