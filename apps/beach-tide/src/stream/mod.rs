//! Per-session stream connections.
//!
//! Each open session gets at most one task that connects, pumps frames into
//! the output buffer, and retries with backoff after unplanned closes. The
//! task is owned by a [`SessionSlot`]; closing a session aborts the task and
//! removes the slot, and every state change made by a task is checked against
//! the slot's generation, so a task that outlives its slot cannot change
//! anything.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::buffer::OutputBuffers;
use crate::event::{BufferSource, EventBus, SyncEvent};
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::transport::{StreamConnection, StreamConnector, StreamFrame, parse_frame};

mod state;

pub use state::{ConnectionState, RetryPolicy, StreamStatus};

#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

pub struct StreamSettings {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub credential: Option<String>,
}

struct Inner {
    connector: Arc<dyn StreamConnector>,
    buffers: Arc<OutputBuffers>,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    retry: RetryPolicy,
    connect_timeout: Duration,
    credential: Option<String>,
    online: AtomicBool,
    next_generation: AtomicU64,
    slots: Mutex<HashMap<String, SessionSlot>>,
}

struct SessionSlot {
    generation: u64,
    state: ConnectionState,
    retry_count: u32,
    task: Option<JoinHandle<()>>,
}

enum StreamEnd {
    /// Socket went away; retry if still wanted.
    Dropped(Option<String>),
    /// Server ended the session.
    ServerClosed(Option<String>),
    /// Our slot is gone; leave without touching anything.
    Superseded,
}

impl StreamManager {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        buffers: Arc<OutputBuffers>,
        registry: Arc<SessionRegistry>,
        events: EventBus,
        settings: StreamSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                buffers,
                registry,
                events,
                retry: settings.retry,
                connect_timeout: settings.connect_timeout,
                credential: settings.credential,
                online: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Record connectivity. Going offline tears every stream down at once;
    /// coming online opens nothing until the next [`reconcile`](Self::reconcile).
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(target = "beach_tide::stream", online, "connectivity changed");
        }
        if !online {
            self.close_all();
        }
    }

    /// Start a stream for `session`. No-op while offline or while an attempt,
    /// live stream or retry timer already exists for it.
    pub fn open(&self, session: &str) {
        if !self.is_online() {
            debug!(
                target = "beach_tide::stream",
                session = %session,
                "offline; not opening stream"
            );
            return;
        }
        let mut slots = self.inner.slots.lock();
        if slots.contains_key(session) {
            return;
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut slot = SessionSlot {
            generation,
            state: ConnectionState::Connecting,
            retry_count: 0,
            task: None,
        };
        self.inner.emit_state(session, ConnectionState::Connecting);
        slot.task = Some(tokio::spawn(run_session(
            self.inner.clone(),
            session.to_string(),
            generation,
        )));
        slots.insert(session.to_string(), slot);
    }

    /// Tear down the stream and any pending retry. Returns false if there was
    /// nothing to close.
    pub fn close(&self, session: &str) -> bool {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.remove(session) else {
            return false;
        };
        if let Some(task) = slot.task {
            task.abort();
        }
        debug!(
            target = "beach_tide::stream",
            session = %session,
            from = %slot.state,
            "stream closed"
        );
        self.inner.emit_state(session, ConnectionState::Disconnected);
        self.inner.publish_live_count(&slots);
        true
    }

    pub fn close_all(&self) {
        let sessions: Vec<String> = self.inner.slots.lock().keys().cloned().collect();
        for session in sessions {
            self.close(&session);
        }
    }

    /// Close streams for sessions no longer open and open streams for new
    /// ones. Sessions that already have a slot keep it.
    pub fn reconcile<I, S>(&self, open_sessions: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let wanted: HashSet<String> = open_sessions
            .into_iter()
            .map(|session| session.as_ref().to_string())
            .collect();
        if !self.is_online() {
            self.close_all();
            return;
        }
        let stale: Vec<String> = self
            .inner
            .slots
            .lock()
            .keys()
            .filter(|session| !wanted.contains(*session))
            .cloned()
            .collect();
        for session in stale {
            self.close(&session);
        }
        for session in &wanted {
            self.open(session);
        }
    }

    pub fn state(&self, session: &str) -> ConnectionState {
        self.inner
            .slots
            .lock()
            .get(session)
            .map(|slot| slot.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn retry_count(&self, session: &str) -> u32 {
        self.inner
            .slots
            .lock()
            .get(session)
            .map(|slot| slot.retry_count)
            .unwrap_or(0)
    }

    pub fn status(&self, session: &str) -> StreamStatus {
        StreamStatus::derive(self.state(session), self.is_online())
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| slot.state == ConnectionState::Connected)
            .count()
    }

    /// Write a tail fetched over request/response. Discarded when the session
    /// is live or no longer open, so a late poll never overwrites stream output.
    pub fn apply_fetched_tail(&self, session: &str, tail: &str, source: BufferSource) -> bool {
        let slots = self.inner.slots.lock();
        let live = slots
            .get(session)
            .map(|slot| slot.state == ConnectionState::Connected)
            .unwrap_or(false);
        if live || !self.inner.registry.is_open(session) {
            trace!(
                target = "beach_tide::stream",
                session = %session,
                live,
                "discarding fetched tail"
            );
            return false;
        }
        self.inner.buffers.replace_if_changed(session, tail, source)
    }
}

impl Inner {
    fn emit_state(&self, session: &str, state: ConnectionState) {
        self.events.emit(SyncEvent::StateChanged {
            session: session.to_string(),
            state,
        });
    }

    fn publish_live_count(&self, slots: &HashMap<String, SessionSlot>) {
        let live = slots
            .values()
            .filter(|slot| slot.state == ConnectionState::Connected)
            .count();
        metrics::LIVE_STREAMS.set(live as i64);
    }

    /// Move a current slot to `state`; false if the slot was replaced or removed.
    fn transition(&self, session: &str, generation: u64, state: ConnectionState) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(session) else {
            return false;
        };
        if slot.generation != generation {
            return false;
        }
        if state == ConnectionState::Connected {
            slot.retry_count = 0;
        }
        if slot.state != state {
            slot.state = state;
            self.emit_state(session, state);
        }
        self.publish_live_count(&slots);
        true
    }

    /// Apply a frame while holding the slot lock so a close cannot interleave.
    fn apply(&self, session: &str, generation: u64, write: impl FnOnce(&OutputBuffers)) -> bool {
        let slots = self.slots.lock();
        match slots.get(session) {
            Some(slot) if slot.generation == generation => {
                write(&self.buffers);
                true
            }
            _ => false,
        }
    }

    /// After an unplanned close: arm a retry or give up. Returns the delay.
    fn schedule_retry(&self, session: &str, generation: u64) -> Option<Duration> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(session)?;
        if slot.generation != generation {
            return None;
        }
        let online = self.online.load(Ordering::SeqCst);
        if !online || !self.registry.is_open(session) {
            slots.remove(session);
            self.emit_state(session, ConnectionState::Disconnected);
            self.publish_live_count(&slots);
            return None;
        }
        slot.retry_count = slot.retry_count.saturating_add(1);
        let retry_count = slot.retry_count;
        let delay = self.retry.delay_for(retry_count);
        if slot.state != ConnectionState::Reconnecting {
            slot.state = ConnectionState::Reconnecting;
            self.emit_state(session, ConnectionState::Reconnecting);
        }
        self.publish_live_count(&slots);
        metrics::RECONNECT_ATTEMPTS.inc();
        debug!(
            target = "beach_tide::stream",
            session = %session,
            retry = retry_count,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        Some(delay)
    }

    /// Terminal close requested by the server: no retry, owner notified once.
    fn finish_server_close(&self, session: &str, generation: u64, reason: Option<String>) {
        let mut slots = self.slots.lock();
        match slots.get(session) {
            Some(slot) if slot.generation == generation => {}
            _ => return,
        }
        slots.remove(session);
        self.emit_state(session, ConnectionState::Disconnected);
        self.publish_live_count(&slots);
        self.registry.forget(session);
        self.buffers.remove(session);
        info!(
            target = "beach_tide::stream",
            session = %session,
            reason = reason.as_deref().unwrap_or(""),
            "server closed session"
        );
        self.events.emit(SyncEvent::SessionClosed {
            session: session.to_string(),
            reason,
        });
    }
}

async fn run_session(inner: Arc<Inner>, session: String, generation: u64) {
    loop {
        let attempt = timeout(
            inner.connect_timeout,
            inner
                .connector
                .connect(&session, inner.credential.as_deref()),
        )
        .await;

        match attempt {
            Ok(Ok(mut connection)) => {
                if !inner.transition(&session, generation, ConnectionState::Connected) {
                    connection.close().await;
                    return;
                }
                info!(target = "beach_tide::stream", session = %session, "stream live");
                let end = pump_frames(&inner, &session, generation, connection.as_mut()).await;
                connection.close().await;
                match end {
                    StreamEnd::Superseded => return,
                    StreamEnd::ServerClosed(reason) => {
                        inner.finish_server_close(&session, generation, reason);
                        return;
                    }
                    StreamEnd::Dropped(error) => {
                        debug!(
                            target = "beach_tide::stream",
                            session = %session,
                            error = error.as_deref().unwrap_or("eof"),
                            "stream dropped"
                        );
                    }
                }
            }
            Ok(Err(err)) => {
                debug!(
                    target = "beach_tide::stream",
                    session = %session,
                    error = %err,
                    "stream connect failed"
                );
            }
            Err(_) => {
                warn!(
                    target = "beach_tide::stream",
                    session = %session,
                    timeout_ms = inner.connect_timeout.as_millis() as u64,
                    "stream handshake timed out"
                );
            }
        }

        let Some(delay) = inner.schedule_retry(&session, generation) else {
            return;
        };
        sleep(delay).await;
        if !inner.transition(&session, generation, ConnectionState::Connecting) {
            return;
        }
    }
}

async fn pump_frames(
    inner: &Inner,
    session: &str,
    generation: u64,
    connection: &mut dyn StreamConnection,
) -> StreamEnd {
    while let Some(message) = connection.recv().await {
        let text = match message {
            Ok(text) => text,
            Err(err) => return StreamEnd::Dropped(Some(err.to_string())),
        };
        let frame = match parse_frame(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target = "beach_tide::stream",
                    session = %session,
                    error = %err,
                    "dropping malformed frame"
                );
                metrics::FRAMES_DROPPED
                    .with_label_values(&["malformed"])
                    .inc();
                continue;
            }
        };
        if let Some(target_session) = frame.session() {
            if target_session != session {
                warn!(
                    target = "beach_tide::stream",
                    session = %session,
                    frame_session = %target_session,
                    kind = frame.kind(),
                    "dropping frame for another session"
                );
                metrics::FRAMES_DROPPED
                    .with_label_values(&["foreign_session"])
                    .inc();
                continue;
            }
        }

        let applied = match frame {
            StreamFrame::Snapshot { data, .. } => inner.apply(session, generation, |buffers| {
                buffers.apply_snapshot(session, &data);
            }),
            StreamFrame::Delta { data, .. } => inner.apply(session, generation, |buffers| {
                buffers.apply_delta(session, &data);
            }),
            StreamFrame::Closed { data, .. } => return StreamEnd::ServerClosed(data),
            StreamFrame::Error { data, .. } => {
                warn!(
                    target = "beach_tide::stream",
                    session = %session,
                    message = data.as_deref().unwrap_or(""),
                    "server reported stream error"
                );
                true
            }
        };
        if !applied {
            return StreamEnd::Superseded;
        }
    }
    StreamEnd::Dropped(None)
}
