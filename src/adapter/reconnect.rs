//! Reconnect state machine
//!
//! ```text
//! Connecting ──► Connected ──► Disconnected ──► Reconnecting ──► Connected
//!                                   ▲                │
//!                                   └────────────────┘ (attempt failed)
//! ```
//!
//! `Closed` and `Failed` are terminal. Delays between attempts grow
//! exponentially from the configured interval up to the configured maximum.

use std::time::Duration;

use super::AdapterError;

/// Status of a broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial connect in progress
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection lost, waiting out the backoff delay
    Disconnected,
    /// Reconnect attempt in progress
    Reconnecting,
    /// Closed by the owner
    Closed,
    /// Gave up reconnecting
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Exponential backoff bounded by a maximum delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Tracks connection state and decides when and whether to retry
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    backoff: Backoff,
    /// Consecutive failed reconnect attempts
    attempts: u32,
    /// 0 = unlimited
    max_attempts: u32,
}

impl ReconnectMachine {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Connecting,
            backoff: Backoff::new(initial, max),
            attempts: 0,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// CONNACK received. Returns true when this completed a reconnect.
    pub fn on_connected(&mut self) -> bool {
        let reconnected = match self.state {
            ConnectionState::Connecting => false,
            ConnectionState::Reconnecting | ConnectionState::Disconnected => true,
            ConnectionState::Connected | ConnectionState::Closed | ConnectionState::Failed => {
                return false;
            }
        };

        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.backoff.reset();
        reconnected
    }

    /// Connection dropped or a reconnect attempt failed.
    ///
    /// Returns the delay before the next attempt, or an error once the
    /// attempt limit is reached.
    pub fn on_connection_lost(&mut self) -> Result<Duration, AdapterError> {
        match self.state {
            ConnectionState::Closed => return Err(AdapterError::Closed),
            ConnectionState::Failed => {
                return Err(AdapterError::ReconnectExhausted(self.attempts));
            }
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                self.attempts += 1;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }

        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            self.state = ConnectionState::Failed;
            return Err(AdapterError::ReconnectExhausted(self.attempts));
        }

        self.state = ConnectionState::Disconnected;
        Ok(self.backoff.next_delay())
    }

    /// Backoff elapsed, a new attempt starts
    pub fn on_retry(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Reconnecting;
        }
    }

    /// Session closed by its owner
    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }
}
