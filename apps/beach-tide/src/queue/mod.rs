//! Outbound command queue.
//!
//! Every command is queued before it is sent, one FIFO per session. A flush
//! walks the FIFO one item at a time under a per-session async lock, so a
//! later command is never delivered before an earlier one. Failed items stay
//! in place with their error until the user retries or discards them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{EventBus, SyncEvent};
use crate::metrics;
use crate::transport::SessionApi;

pub mod history;
pub mod route;
pub mod store;

pub use history::{CommandHistory, HistoryEntry};
pub use route::{CommandRouter, Route, RoutingRules};
pub use store::{FileQueueStore, MemoryQueueStore, QueueStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    Ai,
    Shell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub session: String,
    pub command: String,
    pub mode: CommandMode,
    #[serde(with = "time::serde::rfc3339")]
    pub queued_at: OffsetDateTime,
    pub status: CommandStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedCommand {
    pub fn new(session: &str, command: &str, mode: CommandMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: session.to_string(),
            command: command.to_string(),
            mode,
            queued_at: OffsetDateTime::now_utc(),
            status: CommandStatus::Pending,
            last_error: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("session {0} is read-only; queued commands were kept")]
    ReadOnly(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub sent: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
    /// Newest tail returned by a delivery acknowledgement.
    pub latest_tail: Option<String>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.failed.is_empty()
    }
}

pub struct QueueSettings {
    pub profile: String,
    pub limit: usize,
    pub history_limit: usize,
}

pub struct CommandQueue {
    api: Arc<dyn SessionApi>,
    router: Arc<dyn CommandRouter>,
    store: Arc<dyn QueueStore>,
    events: EventBus,
    profile: String,
    limit: usize,
    state: Mutex<QueueState>,
    persist_lock: Mutex<()>,
    flush_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// An item held in `Sending` by a flush. Dropping the flush before the
/// delivery settles marks the item failed, so it can still be retried.
struct Claim<'a> {
    queue: &'a CommandQueue,
    session: &'a str,
    id: Uuid,
    settled: bool,
}

impl Claim<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.queue.fail(self.session, self.id, store::INTERRUPTED);
        self.queue.persist();
    }
}

struct QueueState {
    queues: HashMap<String, VecDeque<QueuedCommand>>,
    read_only: HashSet<String>,
    history: CommandHistory,
}

impl CommandQueue {
    /// Build the queue and restore whatever the store holds for the profile.
    pub fn load(
        settings: QueueSettings,
        api: Arc<dyn SessionApi>,
        router: Arc<dyn CommandRouter>,
        store: Arc<dyn QueueStore>,
        events: EventBus,
    ) -> Result<Self, QueueError> {
        let restored = store.load(&settings.profile)?;
        let mut queues: HashMap<String, VecDeque<QueuedCommand>> = HashMap::new();
        for command in restored {
            queues
                .entry(command.session.clone())
                .or_default()
                .push_back(command);
        }
        let count: usize = queues.values().map(VecDeque::len).sum();
        if count > 0 {
            info!(
                target = "beach_tide::queue",
                profile = %settings.profile,
                count,
                "restored queued commands"
            );
        }
        Ok(Self {
            api,
            router,
            store,
            events,
            profile: settings.profile,
            limit: settings.limit.max(1),
            state: Mutex::new(QueueState {
                queues,
                read_only: HashSet::new(),
                history: CommandHistory::new(settings.history_limit),
            }),
            persist_lock: Mutex::new(()),
            flush_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Append a trimmed command to the session's FIFO. Past the bound the
    /// oldest entry not currently being sent is dropped.
    pub fn enqueue(
        &self,
        session: &str,
        command: &str,
        mode: CommandMode,
    ) -> Result<QueuedCommand, QueueError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(QueueError::EmptyCommand);
        }
        let item = QueuedCommand::new(session, command, mode);
        {
            let mut state = self.state.lock();
            let queue = state.queues.entry(session.to_string()).or_default();
            queue.push_back(item.clone());
            while queue.len() > self.limit {
                let Some(index) = queue
                    .iter()
                    .position(|queued| queued.status != CommandStatus::Sending)
                else {
                    break;
                };
                if let Some(dropped) = queue.remove(index) {
                    warn!(
                        target = "beach_tide::queue",
                        session = %session,
                        id = %dropped.id,
                        limit = self.limit,
                        "queue full; dropping oldest command"
                    );
                    metrics::COMMANDS.with_label_values(&["dropped"]).inc();
                }
            }
        }
        metrics::COMMANDS.with_label_values(&["queued"]).inc();
        debug!(
            target = "beach_tide::queue",
            session = %session,
            id = %item.id,
            mode = ?mode,
            "command queued"
        );
        self.persist();
        Ok(item)
    }

    /// Deliver queued items in order. Pending items are always attempted;
    /// failed ones only with `include_failed`. A failure does not stop the
    /// items behind it.
    pub async fn flush(
        &self,
        session: &str,
        include_failed: bool,
    ) -> Result<FlushReport, QueueError> {
        if self.is_read_only(session) {
            return Err(QueueError::ReadOnly(session.to_string()));
        }
        let lock = self.flush_lock(session);
        let _flushing = lock.lock().await;

        let mut report = FlushReport::default();
        let mut attempted = HashSet::new();
        loop {
            if self.is_read_only(session) {
                break;
            }
            let Some(item) = self.claim_next(session, include_failed, &attempted) else {
                break;
            };
            attempted.insert(item.id);
            let claim = Claim {
                queue: self,
                session,
                id: item.id,
                settled: false,
            };
            self.persist();

            let route = self.router.route(session, item.mode);
            let delivered = match route {
                Route::Prompt => self.api.send_prompt(session, &item.command).await,
                Route::Shell => self.api.exec_shell(session, &item.command).await,
            };
            match delivered {
                Ok(ack) => {
                    self.complete(session, &item);
                    claim.settle();
                    if ack.tail.is_some() {
                        report.latest_tail = ack.tail;
                    }
                    report.sent.push(item.id);
                }
                Err(err) => {
                    let message = err.to_string();
                    self.fail(session, item.id, &message);
                    claim.settle();
                    report.failed.push((item.id, message));
                }
            }
            self.persist();
        }
        Ok(report)
    }

    /// Reset a failed command to pending. Returns false if no failed command
    /// with that id exists.
    pub fn retry(&self, session: &str, id: Uuid) -> bool {
        let changed = {
            let mut state = self.state.lock();
            state
                .queues
                .get_mut(session)
                .and_then(|queue| queue.iter_mut().find(|item| item.id == id))
                .filter(|item| item.status == CommandStatus::Failed)
                .map(|item| {
                    item.status = CommandStatus::Pending;
                    item.last_error = None;
                })
                .is_some()
        };
        if changed {
            self.persist();
        }
        changed
    }

    /// Remove a command that is not mid-delivery.
    pub fn discard(&self, session: &str, id: Uuid) -> Option<QueuedCommand> {
        let removed = {
            let mut state = self.state.lock();
            let queue = state.queues.get_mut(session)?;
            let index = queue
                .iter()
                .position(|item| item.id == id && item.status != CommandStatus::Sending)?;
            queue.remove(index)
        };
        if removed.is_some() {
            metrics::COMMANDS.with_label_values(&["discarded"]).inc();
            self.persist();
        }
        removed
    }

    pub fn set_read_only(&self, session: &str, read_only: bool) {
        let mut state = self.state.lock();
        if read_only {
            state.read_only.insert(session.to_string());
        } else {
            state.read_only.remove(session);
        }
    }

    pub fn is_read_only(&self, session: &str) -> bool {
        self.state.lock().read_only.contains(session)
    }

    pub fn items(&self, session: &str) -> Vec<QueuedCommand> {
        self.state
            .lock()
            .queues
            .get(session)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self, session: &str) -> bool {
        self.state
            .lock()
            .queues
            .get(session)
            .is_some_and(|queue| queue.iter().any(|item| item.status == CommandStatus::Pending))
    }

    /// Sessions with at least one queued item, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let mut sessions: Vec<_> = self
            .state
            .lock()
            .queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(session, _)| session.clone())
            .collect();
        sessions.sort();
        sessions
    }

    pub fn history(&self, session: &str) -> Vec<HistoryEntry> {
        self.state.lock().history.entries(session)
    }

    /// Whether the command went out, as far as the bounded history recalls.
    pub fn was_sent(&self, session: &str, id: Uuid) -> bool {
        self.state.lock().history.contains(session, id)
    }

    pub fn find(&self, session: &str, id: Uuid) -> Option<QueuedCommand> {
        self.state
            .lock()
            .queues
            .get(session)?
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    fn flush_lock(&self, session: &str) -> Arc<AsyncMutex<()>> {
        self.flush_locks
            .lock()
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn claim_next(
        &self,
        session: &str,
        include_failed: bool,
        attempted: &HashSet<Uuid>,
    ) -> Option<QueuedCommand> {
        let mut state = self.state.lock();
        let item = state.queues.get_mut(session)?.iter_mut().find(|item| {
            !attempted.contains(&item.id)
                && (item.status == CommandStatus::Pending
                    || (include_failed && item.status == CommandStatus::Failed))
        })?;
        item.status = CommandStatus::Sending;
        Some(item.clone())
    }

    fn complete(&self, session: &str, item: &QueuedCommand) {
        {
            let mut state = self.state.lock();
            if let Some(queue) = state.queues.get_mut(session) {
                queue.retain(|queued| queued.id != item.id);
            }
            state.history.push(
                session,
                HistoryEntry {
                    id: item.id,
                    command: item.command.clone(),
                    mode: item.mode,
                    sent_at: OffsetDateTime::now_utc(),
                },
            );
        }
        metrics::COMMANDS.with_label_values(&["sent"]).inc();
        debug!(target = "beach_tide::queue", session = %session, id = %item.id, "command sent");
        self.events.emit(SyncEvent::CommandSent {
            session: session.to_string(),
            id: item.id,
        });
    }

    fn fail(&self, session: &str, id: Uuid, message: &str) {
        {
            let mut state = self.state.lock();
            if let Some(item) = state
                .queues
                .get_mut(session)
                .and_then(|queue| queue.iter_mut().find(|item| item.id == id))
            {
                item.status = CommandStatus::Failed;
                item.last_error = Some(message.to_string());
            }
        }
        metrics::COMMANDS.with_label_values(&["failed"]).inc();
        warn!(
            target = "beach_tide::queue",
            session = %session,
            id = %id,
            error = %message,
            "command delivery failed"
        );
        self.events.emit(SyncEvent::CommandFailed {
            session: session.to_string(),
            id,
            error: message.to_string(),
        });
    }

    /// Save failures are logged; the in-memory queue stays authoritative.
    fn persist(&self) {
        let _ordered = self.persist_lock.lock();
        let snapshot: Vec<QueuedCommand> = {
            let state = self.state.lock();
            let mut sessions: Vec<_> = state.queues.keys().collect();
            sessions.sort();
            sessions
                .into_iter()
                .flat_map(|session| state.queues[session].iter().cloned())
                .collect()
        };
        if let Err(err) = self.store.save(&self.profile, &snapshot) {
            warn!(
                target = "beach_tide::queue",
                profile = %self.profile,
                error = %err,
                "failed to persist command queue"
            );
        }
    }
}
