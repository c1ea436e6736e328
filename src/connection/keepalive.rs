//! Ping/pong liveness tracking.

use std::time::Duration;

use tokio::time::Instant;

/// What the engine must do when the keepalive deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Send a ping and wait for the pong.
    SendPing,
    /// The previous ping was never answered.
    TimedOut,
}

/// Keepalive schedule for one connection.
///
/// The first tick is one interval after the connection is established. A pong
/// received at any time clears the outstanding ping.
#[derive(Debug, Clone)]
pub struct KeepAliveTimer {
    interval: Option<Duration>,
    waiting_for_pong: bool,
    next_deadline: Option<Instant>,
}

impl KeepAliveTimer {
    /// Start the schedule at `now`. With no interval the timer never fires.
    #[must_use]
    pub fn new(interval: Option<Duration>, now: Instant) -> Self {
        Self {
            interval,
            waiting_for_pong: false,
            next_deadline: interval.map(|interval| now + interval),
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.next_deadline
    }

    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong
    }

    /// Advance past a tick that fired at `now`.
    ///
    /// A timeout disarms the timer.
    pub fn on_tick(&mut self, now: Instant) -> Option<KeepAliveAction> {
        let interval = self.interval?;
        if self.waiting_for_pong {
            self.next_deadline = None;
            return Some(KeepAliveAction::TimedOut);
        }
        self.waiting_for_pong = true;
        self.next_deadline = Some(now + interval);
        Some(KeepAliveAction::SendPing)
    }

    pub fn on_pong(&mut self) {
        self.waiting_for_pong = false;
    }

    /// Stop firing, used once the close handshake starts.
    pub fn disarm(&mut self) {
        self.next_deadline = None;
    }
}
