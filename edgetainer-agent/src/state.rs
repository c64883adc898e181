//! Connection state machine
//!
//! The connect loop is one state machine: Idle → Connecting → Connected, back
//! through Cooling-Down on any failure, Stopped on cancellation. The states
//! and the backoff are plain observable values so the loop's behavior can be
//! tested without a network.

use std::time::Duration;

/// Base reconnect delay.
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Maximum reconnect delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// States of the device tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    CoolingDown,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::CoolingDown => "cooling-down",
            ConnectionState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Exponential reconnect backoff.
///
/// Doubles on every failed or short-lived session, capped at [`BACKOFF_CAP`].
/// It resets to base only after a session has stayed connected for at least
/// the cap, so a link that flaps right after the handshake does not hammer
/// the server at the base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The delay the next Cooling-Down period will sleep.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Account for a finished session and return the delay to sleep before
    /// the next attempt. `connected_for` is `None` when the handshake never
    /// completed.
    pub fn on_session_end(&mut self, connected_for: Option<Duration>) -> Duration {
        if let Some(sustained) = connected_for {
            if sustained >= self.cap {
                self.current = self.base;
            }
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_up_to_cap() {
        let mut backoff = Backoff::default();
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(backoff.on_session_end(None).as_secs());
        }
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn test_sustained_connection_resets() {
        let mut backoff = Backoff::default();
        for _ in 0..6 {
            backoff.on_session_end(None);
        }
        assert_eq!(backoff.current(), Duration::from_secs(300));

        // A session that held for the cap resets the ladder.
        let delay = backoff.on_session_end(Some(Duration::from_secs(301)));
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_secs(10));
    }

    #[test]
    fn test_short_connection_keeps_climbing() {
        let mut backoff = Backoff::default();
        backoff.on_session_end(None);
        // Connected for two seconds, then dropped: not sustained.
        let delay = backoff.on_session_end(Some(Duration::from_secs(2)));
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn test_manual_reset() {
        let mut backoff = Backoff::default();
        backoff.on_session_end(None);
        backoff.on_session_end(None);
        backoff.reset();
        assert_eq!(backoff.current(), BACKOFF_BASE);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::CoolingDown.to_string(), "cooling-down");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
