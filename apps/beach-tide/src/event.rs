use tokio::sync::broadcast;
use uuid::Uuid;

use crate::stream::ConnectionState;

/// Which producer last wrote a session buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSource {
    Snapshot,
    Delta,
    Poll,
    Resync,
}

/// Notifications for whoever owns the engine (usually the UI).
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged {
        session: String,
        state: ConnectionState,
    },
    BufferUpdated {
        session: String,
        source: BufferSource,
        len: usize,
    },
    /// The server ended the session; emitted once per closure.
    SessionClosed {
        session: String,
        reason: Option<String>,
    },
    CommandSent {
        session: String,
        id: Uuid,
    },
    CommandFailed {
        session: String,
        id: Uuid,
        error: String,
    },
    WatchMatched {
        session: String,
        rule: Uuid,
        pattern: String,
    },
}

impl SyncEvent {
    pub fn session(&self) -> &str {
        match self {
            SyncEvent::StateChanged { session, .. }
            | SyncEvent::BufferUpdated { session, .. }
            | SyncEvent::SessionClosed { session, .. }
            | SyncEvent::CommandSent { session, .. }
            | SyncEvent::CommandFailed { session, .. }
            | SyncEvent::WatchMatched { session, .. } => session,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
