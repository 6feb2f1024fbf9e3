use std::fmt;
use std::time::Duration;

/// Per-session stream state, owned by the stream manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// What the UI shows for a session, and whether polling should run for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Live,
    Polling,
    Reconnecting,
    Offline,
}

impl StreamStatus {
    pub fn derive(state: ConnectionState, online: bool) -> Self {
        if !online {
            return StreamStatus::Offline;
        }
        match state {
            ConnectionState::Connected => StreamStatus::Live,
            ConnectionState::Reconnecting => StreamStatus::Reconnecting,
            ConnectionState::Connecting | ConnectionState::Disconnected => StreamStatus::Polling,
        }
    }

    /// Polling and a live stream never run together for one session.
    pub fn wants_poll(self) -> bool {
        matches!(self, StreamStatus::Polling | StreamStatus::Reconnecting)
    }
}

/// Exponential backoff: `min(base * factor^(retry - 1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(900),
            factor: 1.5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let cap_ms = self.max_delay.as_millis() as f64;
        let millis = (self.base.as_millis() as f64 * self.factor.max(1.0).powi(exponent))
            .min(cap_ms);
        Duration::from_millis(millis.round() as u64)
    }
}
