//! In-memory transports for tests and offline demos.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::time::Instant;

use super::{
    CommandAck, SessionApi, SessionSummary, StreamConnection, StreamConnector, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Prompt,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session: String,
    pub kind: DeliveryKind,
    pub payload: String,
}

#[derive(Default)]
struct ApiState {
    sessions: Vec<SessionSummary>,
    tails: HashMap<String, String>,
    tail_calls: HashMap<String, usize>,
    ack_tails: HashMap<String, String>,
    failing_payloads: HashMap<String, String>,
    deliveries: Vec<Delivery>,
    ping_calls: usize,
    ping_failure: Option<String>,
}

/// Scriptable `SessionApi`.
#[derive(Default)]
pub struct MockSessionApi {
    state: Mutex<ApiState>,
    tail_delay: Mutex<Option<Duration>>,
    ping_delay: Mutex<Option<Duration>>,
    delivery_delay: Mutex<Option<Duration>>,
}

impl MockSessionApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sessions(&self, ids: &[&str]) {
        self.state.lock().sessions = ids
            .iter()
            .map(|id| SessionSummary {
                id: id.to_string(),
                created_at: None,
            })
            .collect();
    }

    pub fn set_tail(&self, session: &str, tail: &str) {
        self.state
            .lock()
            .tails
            .insert(session.to_string(), tail.to_string());
    }

    /// Tail returned in the acknowledgement of commands for `session`.
    pub fn set_ack_tail(&self, session: &str, tail: &str) {
        self.state
            .lock()
            .ack_tails
            .insert(session.to_string(), tail.to_string());
    }

    pub fn set_tail_delay(&self, delay: Option<Duration>) {
        *self.tail_delay.lock() = delay;
    }

    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.ping_delay.lock() = delay;
    }

    pub fn set_delivery_delay(&self, delay: Option<Duration>) {
        *self.delivery_delay.lock() = delay;
    }

    /// Reject any delivery whose payload equals `payload`.
    pub fn fail_payload(&self, payload: &str, message: &str) {
        self.state
            .lock()
            .failing_payloads
            .insert(payload.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing_payloads.clear();
    }

    pub fn set_ping_failure(&self, message: Option<&str>) {
        self.state.lock().ping_failure = message.map(str::to_string);
    }

    pub fn tail_calls(&self, session: &str) -> usize {
        self.state
            .lock()
            .tail_calls
            .get(session)
            .copied()
            .unwrap_or(0)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    pub fn delivered_payloads(&self, session: &str) -> Vec<String> {
        self.state
            .lock()
            .deliveries
            .iter()
            .filter(|delivery| delivery.session == session)
            .map(|delivery| delivery.payload.clone())
            .collect()
    }

    pub fn ping_calls(&self) -> usize {
        self.state.lock().ping_calls
    }

    async fn deliver(
        &self,
        session: &str,
        payload: &str,
        kind: DeliveryKind,
    ) -> Result<CommandAck, TransportError> {
        let delay = *self.delivery_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(message) = state.failing_payloads.get(payload) {
            return Err(TransportError::Rejected(message.clone()));
        }
        state.deliveries.push(Delivery {
            session: session.to_string(),
            kind,
            payload: payload.to_string(),
        });
        Ok(CommandAck {
            message: None,
            tail: state.ack_tails.get(session).cloned(),
        })
    }
}

#[async_trait]
impl SessionApi for MockSessionApi {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, TransportError> {
        Ok(self.state.lock().sessions.clone())
    }

    async fn fetch_tail(&self, session: &str, _lines: usize) -> Result<String, TransportError> {
        *self
            .state
            .lock()
            .tail_calls
            .entry(session.to_string())
            .or_default() += 1;
        let delay = *self.tail_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state
            .lock()
            .tails
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_prompt(
        &self,
        session: &str,
        payload: &str,
    ) -> Result<CommandAck, TransportError> {
        self.deliver(session, payload, DeliveryKind::Prompt).await
    }

    async fn exec_shell(&self, session: &str, payload: &str) -> Result<CommandAck, TransportError> {
        self.deliver(session, payload, DeliveryKind::Shell).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.ping_calls += 1;
        match &state.ping_failure {
            Some(message) => Err(TransportError::Rejected(message.clone())),
            None => Ok(()),
        }
    }
}

/// What the next connection attempt for a session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
    /// Never completes; exercises the connect timeout.
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    attempts: HashMap<String, Vec<Instant>>,
    scripted: HashMap<String, VecDeque<ConnectOutcome>>,
    refuse_all: HashSet<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    credentials: Vec<Option<String>>,
}

impl ConnectorState {
    fn enter(&mut self, session: &str) {
        let current = self.in_flight.entry(session.to_string()).or_default();
        *current += 1;
        let current = *current;
        let max = self.max_in_flight.entry(session.to_string()).or_default();
        *max = (*max).max(current);
    }

    fn leave(&mut self, session: &str) {
        if let Some(current) = self.in_flight.get_mut(session) {
            *current = current.saturating_sub(1);
        }
    }
}

/// Tracks one attempt or open stream; leaving scope ends it.
struct FlightGuard {
    state: Arc<Mutex<ConnectorState>>,
    session: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.state.lock().leave(&self.session);
    }
}

/// Scriptable `StreamConnector`; every accepted connection is handed to the
/// test as a [`MockServerStream`].
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    attempt_notify: Notify,
    accepted_tx: mpsc::UnboundedSender<MockServerStream>,
    accepted_rx: AsyncMutex<mpsc::UnboundedReceiver<MockServerStream>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            attempt_notify: Notify::new(),
            accepted_tx,
            accepted_rx: AsyncMutex::new(accepted_rx),
        }
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next attempts; afterwards attempts are accepted.
    pub fn script(&self, session: &str, outcomes: &[ConnectOutcome]) {
        self.state
            .lock()
            .scripted
            .entry(session.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    pub fn refuse_all(&self, session: &str, refuse: bool) {
        let mut state = self.state.lock();
        if refuse {
            state.refuse_all.insert(session.to_string());
        } else {
            state.refuse_all.remove(session);
        }
    }

    pub fn attempts(&self, session: &str) -> usize {
        self.state
            .lock()
            .attempts
            .get(session)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn attempt_times(&self, session: &str) -> Vec<Instant> {
        self.state
            .lock()
            .attempts
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of simultaneous attempts plus open streams seen.
    pub fn max_in_flight(&self, session: &str) -> usize {
        self.state
            .lock()
            .max_in_flight
            .get(session)
            .copied()
            .unwrap_or(0)
    }

    pub fn credentials(&self) -> Vec<Option<String>> {
        self.state.lock().credentials.clone()
    }

    pub async fn wait_for_attempts(&self, session: &str, count: usize) {
        loop {
            let notified = self.attempt_notify.notified();
            if self.attempts(session) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Next accepted connection, in accept order.
    pub async fn next_connection(&self) -> MockServerStream {
        self.accepted_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector owns the sender")
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(
        &self,
        session: &str,
        credential: Option<&str>,
    ) -> Result<Box<dyn StreamConnection>, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            state
                .attempts
                .entry(session.to_string())
                .or_default()
                .push(Instant::now());
            state.credentials.push(credential.map(str::to_string));
            state.enter(session);
            if state.refuse_all.contains(session) {
                ConnectOutcome::Refuse
            } else {
                state
                    .scripted
                    .get_mut(session)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(ConnectOutcome::Accept)
            }
        };
        let guard = FlightGuard {
            state: self.state.clone(),
            session: session.to_string(),
        };
        self.attempt_notify.notify_waiters();

        match outcome {
            ConnectOutcome::Refuse => Err(TransportError::Rejected("connection refused".into())),
            ConnectOutcome::Hang => {
                let _guard = guard;
                std::future::pending().await
            }
            ConnectOutcome::Accept => {
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicBool::new(false));
                let server = MockServerStream {
                    session: session.to_string(),
                    credential: credential.map(str::to_string),
                    frames: Some(frames_tx),
                    closed_by_client: closed.clone(),
                };
                let _ = self.accepted_tx.send(server);
                Ok(Box::new(MockStreamConnection {
                    frames: frames_rx,
                    closed,
                    _guard: guard,
                }))
            }
        }
    }
}

struct MockStreamConnection {
    frames: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
    _guard: FlightGuard,
}

#[async_trait]
impl StreamConnection for MockStreamConnection {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.frames.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.frames.close();
    }
}

impl Drop for MockStreamConnection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Server side of an accepted mock stream.
pub struct MockServerStream {
    pub session: String,
    pub credential: Option<String>,
    frames: Option<mpsc::UnboundedSender<String>>,
    closed_by_client: Arc<AtomicBool>,
}

impl MockServerStream {
    /// Returns false once the client side is gone.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.frames
            .as_ref()
            .map(|tx| tx.send(text.into()).is_ok())
            .unwrap_or(false)
    }

    pub fn send_snapshot(&self, data: &str) -> bool {
        self.send_frame("snapshot", data)
    }

    pub fn send_delta(&self, data: &str) -> bool {
        self.send_frame("delta", data)
    }

    pub fn send_closed(&self) -> bool {
        self.send_raw(json!({ "type": "session_closed", "session": self.session }).to_string())
    }

    /// Drop the connection without a closing frame.
    pub fn disconnect(&mut self) {
        self.frames = None;
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }

    fn send_frame(&self, kind: &str, data: &str) -> bool {
        self.send_raw(json!({ "type": kind, "session": self.session, "data": data }).to_string())
    }
}
