//! Owner-facing facade that wires the registry, streams, polling, queue and
//! health tracking together.
//!
//! The UI talks only to [`SyncEngine`]: it feeds in connectivity and the set
//! of open sessions, sends commands, and reads buffers and status. Everything
//! it needs to react to arrives as [`SyncEvent`]s from
//! [`subscribe`](SyncEngine::subscribe).

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::OutputBuffers;
use crate::config::{ConfigError, SyncConfig};
use crate::event::{BufferSource, EventBus, SyncEvent};
use crate::health::{HealthSnapshot, HealthTracker};
use crate::metrics;
use crate::poll::PollFallback;
use crate::queue::{
    CommandMode, CommandQueue, CommandStatus, FileQueueStore, FlushReport, HistoryEntry,
    QueueError, QueueSettings, QueueStore, QueuedCommand, RoutingRules, StoreError,
};
use crate::registry::SessionRegistry;
use crate::stream::{ConnectionState, StreamManager, StreamSettings, StreamStatus};
use crate::transport::{
    HttpSessionApi, SessionApi, SessionSummary, StreamConnector, TransportError,
    WebSocketConnector,
};
use crate::watch::{WatchRule, WatchRules};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("client is offline")]
    Offline,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a command handed to [`SyncEngine::send_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Held in the queue until the next flush.
    Queued,
    /// Kept in the queue as failed with this message.
    Failed(String),
    /// Removed before it was sent, by the queue bound or a discard.
    Dropped,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: SyncConfig,
    api: Arc<dyn SessionApi>,
    events: EventBus,
    registry: Arc<SessionRegistry>,
    buffers: Arc<OutputBuffers>,
    streams: StreamManager,
    poll: PollFallback,
    queue: CommandQueue,
    health: HealthTracker,
    routing: Arc<RoutingRules>,
    watches: WatchRules,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn StreamConnector>,
        store: Arc<dyn QueueStore>,
    ) -> Result<Self, EngineError> {
        let events = EventBus::default();
        let registry = Arc::new(SessionRegistry::new());
        let buffers = Arc::new(OutputBuffers::new(events.clone()));
        let streams = StreamManager::new(
            connector,
            buffers.clone(),
            registry.clone(),
            events.clone(),
            StreamSettings {
                retry: config.retry,
                connect_timeout: config.connect_timeout,
                credential: config.token.clone(),
            },
        );
        let poll = PollFallback::new(
            api.clone(),
            streams.clone(),
            registry.clone(),
            config.tail_lines,
            config.poll_interval,
        );
        let health = HealthTracker::new(
            api.clone(),
            streams.clone(),
            registry.clone(),
            config.ping_interval,
        );
        let routing = Arc::new(RoutingRules::permissive());
        let queue = CommandQueue::load(
            QueueSettings {
                profile: config.profile.clone(),
                limit: config.queue_limit,
                history_limit: config.history_limit,
            },
            api.clone(),
            routing.clone(),
            store,
            events.clone(),
        )?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                api,
                events,
                registry,
                buffers,
                streams,
                poll,
                queue,
                health,
                routing,
                watches: WatchRules::new(),
                pump: Mutex::new(None),
            }),
        })
    }

    /// Engine over HTTP and WebSocket transports with the on-disk queue.
    pub fn connect(config: SyncConfig) -> Result<Self, EngineError> {
        config.stream_base_url()?;
        let api = Arc::new(HttpSessionApi::new(&config)?);
        let connector = Arc::new(WebSocketConnector::new(&config)?);
        let store = Arc::new(FileQueueStore::default_location()?);
        Self::new(config, api, connector, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Start the internal event pump. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut pump = self.inner.pump.lock();
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let rx = self.inner.events.subscribe();
        *pump = Some(tokio::spawn(run_pump(Arc::downgrade(&self.inner), rx)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.streams.is_online()
    }

    /// Feed in the external connectivity signal.
    pub fn set_online(&self, online: bool) {
        self.inner.streams.set_online(online);
        self.inner.reconcile();
    }

    pub fn open_session(&self, session: &str) {
        if self.inner.registry.open(session) {
            info!(target = "beach_tide::engine", session = %session, "session opened");
        }
        self.inner.reconcile();
    }

    /// Hide a session: its stream is closed and its buffer released.
    pub fn hide_session(&self, session: &str) {
        self.inner.registry.hide(session);
        self.inner.reconcile();
        self.inner.release(session);
    }

    /// Replace the open set; sessions that drop out are hidden.
    pub fn set_open_sessions<I, S>(&self, sessions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before: HashSet<String> = self.inner.registry.open_sessions().into_iter().collect();
        self.inner.registry.set_open(sessions);
        let after: HashSet<String> = self.inner.registry.open_sessions().into_iter().collect();
        self.inner.reconcile();
        for session in before.difference(&after) {
            self.inner.release(session);
        }
    }

    pub fn open_sessions(&self) -> Vec<String> {
        self.inner.registry.open_sessions()
    }

    /// Reload the server's session directory into the known set.
    pub async fn refresh_directory(&self) -> Result<Vec<SessionSummary>, EngineError> {
        if !self.is_online() {
            return Err(EngineError::Offline);
        }
        let sessions = self.inner.api.list_sessions().await?;
        debug!(
            target = "beach_tide::engine",
            count = sessions.len(),
            "session directory refreshed"
        );
        self.inner.registry.set_known(sessions.clone());
        Ok(sessions)
    }

    pub fn known_sessions(&self) -> Vec<SessionSummary> {
        self.inner.registry.known_sessions()
    }

    /// Queue a command, then flush the session when possible. The command is
    /// always queued first so it can never overtake older queued commands.
    pub async fn send_command(
        &self,
        session: &str,
        command: &str,
        mode: CommandMode,
    ) -> Result<SendOutcome, EngineError> {
        let queue = &self.inner.queue;
        let item = queue.enqueue(session, command, mode)?;
        let mut sent = false;
        if self.is_online() && !queue.is_read_only(session) {
            match self.flush(session, false).await {
                Ok(report) => sent = report.sent.contains(&item.id),
                Err(EngineError::Offline) | Err(EngineError::Queue(QueueError::ReadOnly(_))) => {}
                Err(err) => return Err(err),
            }
        }
        // A flush already running may have delivered it for us.
        if sent || queue.was_sent(session, item.id) {
            return Ok(SendOutcome::Delivered);
        }
        Ok(match queue.find(session, item.id) {
            Some(queued) if queued.status == CommandStatus::Failed => SendOutcome::Failed(
                queued
                    .last_error
                    .unwrap_or_else(|| "delivery failed".to_string()),
            ),
            Some(_) => SendOutcome::Queued,
            None => {
                warn!(
                    target = "beach_tide::engine",
                    session = %session,
                    id = %item.id,
                    "command left the queue without being sent"
                );
                SendOutcome::Dropped
            }
        })
    }

    /// Deliver the session's queued commands in order.
    pub async fn flush(
        &self,
        session: &str,
        include_failed: bool,
    ) -> Result<FlushReport, EngineError> {
        self.inner.flush(session, include_failed).await
    }

    pub fn retry_command(&self, session: &str, id: Uuid) -> bool {
        self.inner.queue.retry(session, id)
    }

    pub fn discard_command(&self, session: &str, id: Uuid) -> Option<QueuedCommand> {
        self.inner.queue.discard(session, id)
    }

    pub fn set_read_only(&self, session: &str, read_only: bool) {
        self.inner.queue.set_read_only(session, read_only);
    }

    pub fn routing(&self) -> &RoutingRules {
        &self.inner.routing
    }

    pub fn queued(&self, session: &str) -> Vec<QueuedCommand> {
        self.inner.queue.items(session)
    }

    pub fn history(&self, session: &str) -> Vec<HistoryEntry> {
        self.inner.queue.history(session)
    }

    /// Fetch the tail now and replace the buffer if it differs, whatever the
    /// stream is doing. Returns whether the buffer changed.
    pub async fn resync(&self, session: &str) -> Result<bool, EngineError> {
        if !self.is_online() {
            return Err(EngineError::Offline);
        }
        let tail = self
            .inner
            .api
            .fetch_tail(session, self.inner.config.tail_lines)
            .await?;
        if !self.inner.registry.is_open(session) {
            return Ok(false);
        }
        Ok(self
            .inner
            .buffers
            .replace_if_changed(session, &tail, BufferSource::Resync))
    }

    /// One-off tail read that leaves the buffer alone.
    pub async fn fetch_tail(&self, session: &str, lines: usize) -> Result<String, EngineError> {
        if !self.is_online() {
            return Err(EngineError::Offline);
        }
        Ok(self.inner.api.fetch_tail(session, lines).await?)
    }

    pub fn buffer(&self, session: &str) -> Option<String> {
        self.inner.buffers.get(session)
    }

    pub fn state(&self, session: &str) -> ConnectionState {
        self.inner.streams.state(session)
    }

    pub fn status(&self, session: &str) -> StreamStatus {
        self.inner.streams.status(session)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    pub async fn ping(&self) -> Option<Duration> {
        self.inner.health.ping_once().await
    }

    pub fn add_watch(
        &self,
        session: Option<&str>,
        pattern: &str,
        ignore_case: bool,
    ) -> Option<Uuid> {
        self.inner.watches.add(session, pattern, ignore_case)
    }

    pub fn remove_watch(&self, id: Uuid) -> bool {
        self.inner.watches.remove(id)
    }

    pub fn watches(&self) -> Vec<WatchRule> {
        self.inner.watches.rules()
    }

    /// Stop every task the engine owns. Queued commands stay persisted.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.pump.lock().take() {
            task.abort();
        }
        self.inner.poll.stop();
        self.inner.health.stop();
        self.inner.streams.close_all();
        info!(target = "beach_tide::engine", "engine stopped");
    }
}

impl EngineInner {
    fn reconcile(&self) {
        let open = self.registry.open_sessions();
        metrics::OPEN_SESSIONS.set(open.len() as i64);
        self.streams.reconcile(&open);
        if self.streams.is_online() {
            self.poll.ensure_running();
            self.health.ensure_running();
        } else {
            self.poll.stop();
            self.health.stop();
        }
    }

    fn release(&self, session: &str) {
        if !self.registry.is_open(session) {
            self.buffers.remove(session);
            self.watches.forget_session(session);
        }
    }

    async fn flush(
        &self,
        session: &str,
        include_failed: bool,
    ) -> Result<FlushReport, EngineError> {
        if !self.streams.is_online() {
            return Err(EngineError::Offline);
        }
        let report = self.queue.flush(session, include_failed).await?;
        if let Some(tail) = &report.latest_tail {
            self.streams
                .apply_fetched_tail(session, tail, BufferSource::Poll);
        }
        Ok(report)
    }

    fn wants_drain(&self, session: &str) -> bool {
        self.queue.has_pending(session) && !self.queue.is_read_only(session)
    }

    fn scan_watches(&self, session: &str) {
        if self.watches.is_empty() {
            return;
        }
        let Some(text) = self.buffers.get(session) else {
            return;
        };
        for hit in self.watches.scan(session, &text) {
            self.events.emit(SyncEvent::WatchMatched {
                session: session.to_string(),
                rule: hit.rule,
                pattern: hit.pattern,
            });
        }
    }
}

async fn run_pump(engine: Weak<EngineInner>, mut rx: broadcast::Receiver<SyncEvent>) {
    loop {
        let received = rx.recv().await;
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let event = match received {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "beach_tide::engine", skipped, "event pump lagged");
                catch_up(&inner);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            SyncEvent::StateChanged {
                session,
                state: ConnectionState::Connected,
            } => {
                if inner.wants_drain(&session) {
                    spawn_drain(inner, session);
                }
            }
            SyncEvent::StateChanged { .. } => {
                if inner.streams.is_online() {
                    inner.poll.ensure_running();
                }
            }
            SyncEvent::BufferUpdated { session, .. } => inner.scan_watches(&session),
            SyncEvent::SessionClosed { session, .. } => {
                inner.watches.forget_session(&session);
                metrics::OPEN_SESSIONS.set(inner.registry.open_count() as i64);
            }
            SyncEvent::CommandSent { .. }
            | SyncEvent::CommandFailed { .. }
            | SyncEvent::WatchMatched { .. } => {}
        }
    }
}

/// Skipped events are gone; rebuild their effects from current state.
fn catch_up(inner: &Arc<EngineInner>) {
    metrics::OPEN_SESSIONS.set(inner.registry.open_count() as i64);
    if !inner.streams.is_online() {
        return;
    }
    inner.poll.ensure_running();
    for session in inner.registry.open_sessions() {
        inner.scan_watches(&session);
        if inner.streams.state(&session) == ConnectionState::Connected
            && inner.wants_drain(&session)
        {
            spawn_drain(inner.clone(), session);
        }
    }
}

fn spawn_drain(inner: Arc<EngineInner>, session: String) {
    tokio::spawn(async move {
        match inner.flush(&session, false).await {
            Ok(report) if !report.is_empty() => debug!(
                target = "beach_tide::engine",
                session = %session,
                sent = report.sent.len(),
                failed = report.failed.len(),
                "drained queue after reconnect"
            ),
            Ok(_) => {}
            Err(err) => debug!(
                target = "beach_tide::engine",
                session = %session,
                error = %err,
                "queue drain skipped"
            ),
        }
    });
}
