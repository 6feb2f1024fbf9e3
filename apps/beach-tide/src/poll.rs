use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace};

use crate::event::BufferSource;
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::stream::StreamManager;
use crate::transport::SessionApi;

/// Pulls output tails for open sessions whose stream is not live.
#[derive(Clone)]
pub struct PollFallback {
    inner: Arc<PollInner>,
}

struct PollInner {
    api: Arc<dyn SessionApi>,
    streams: StreamManager,
    registry: Arc<SessionRegistry>,
    tail_lines: usize,
    every: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Marks a session as polling until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    session: String,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, session: &str) -> Option<Self> {
        if !set.lock().insert(session.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            session: session.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.session);
    }
}

impl PollFallback {
    pub fn new(
        api: Arc<dyn SessionApi>,
        streams: StreamManager,
        registry: Arc<SessionRegistry>,
        tail_lines: usize,
        every: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PollInner {
                api,
                streams,
                registry,
                tail_lines,
                every,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Start one poll per eligible session. Sessions with a poll still
    /// outstanding are skipped, not queued. Returns how many were started.
    pub fn tick(&self) -> usize {
        let inner = &self.inner;
        if !inner.streams.is_online() {
            return 0;
        }
        let mut started = 0;
        for session in inner.registry.open_sessions() {
            if !inner.streams.status(&session).wants_poll() {
                continue;
            }
            let Some(guard) = InFlight::claim(&inner.in_flight, &session) else {
                trace!(
                    target = "beach_tide::poll",
                    session = %session,
                    "poll already in flight"
                );
                continue;
            };
            let inner = inner.clone();
            tokio::spawn(async move {
                poll_one(&inner, &session).await;
                drop(guard);
            });
            started += 1;
        }
        started
    }

    pub fn in_flight(&self, session: &str) -> bool {
        self.inner.in_flight.lock().contains(session)
    }

    /// Whether any open session currently lacks a live stream.
    pub fn has_work(&self) -> bool {
        let inner = &self.inner;
        inner.streams.is_online()
            && inner
                .registry
                .open_sessions()
                .iter()
                .any(|session| inner.streams.status(session).wants_poll())
    }

    /// Run [`tick`](Self::tick) on the configured interval until the client
    /// goes offline or every open session is live. Calling while running is
    /// a no-op.
    pub fn ensure_running(&self) {
        let inner = &self.inner;
        if !self.has_work() {
            return;
        }
        let mut driver = inner.driver.lock();
        if driver.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let poller = self.clone();
        *driver = Some(tokio::spawn(async move {
            let mut ticker = interval(poller.inner.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !poller.has_work() {
                    debug!(target = "beach_tide::poll", "poll driver idle; stopping");
                    break;
                }
                poller.tick();
            }
        }));
        debug!(
            target = "beach_tide::poll",
            every_ms = inner.every.as_millis() as u64,
            "poll driver started"
        );
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.driver.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .driver
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

async fn poll_one(inner: &PollInner, session: &str) {
    match inner.api.fetch_tail(session, inner.tail_lines).await {
        Ok(tail) => {
            let applied = inner
                .streams
                .apply_fetched_tail(session, &tail, BufferSource::Poll);
            let result = if applied { "applied" } else { "unchanged" };
            metrics::POLLS.with_label_values(&[result]).inc();
            trace!(target = "beach_tide::poll", session = %session, result, "poll finished");
        }
        Err(err) => {
            metrics::POLLS.with_label_values(&["error"]).inc();
            debug!(
                target = "beach_tide::poll",
                session = %session,
                error = %err,
                "tail poll failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OutputBuffers;
    use crate::event::EventBus;
    use crate::stream::{RetryPolicy, StreamSettings};
    use crate::transport::mock::{MockConnector, MockSessionApi};
    use tokio::time::sleep;

    struct Harness {
        api: Arc<MockSessionApi>,
        connector: Arc<MockConnector>,
        buffers: Arc<OutputBuffers>,
        registry: Arc<SessionRegistry>,
        streams: StreamManager,
        poll: PollFallback,
    }

    fn harness() -> Harness {
        let api = Arc::new(MockSessionApi::new());
        let connector = Arc::new(MockConnector::new());
        let events = EventBus::default();
        let buffers = Arc::new(OutputBuffers::new(events.clone()));
        let registry = Arc::new(SessionRegistry::new());
        let streams = StreamManager::new(
            connector.clone(),
            buffers.clone(),
            registry.clone(),
            events,
            StreamSettings {
                retry: RetryPolicy::default(),
                connect_timeout: Duration::from_secs(5),
                credential: None,
            },
        );
        let poll = PollFallback::new(
            api.clone(),
            streams.clone(),
            registry.clone(),
            200,
            Duration::from_secs(2),
        );
        Harness {
            api,
            connector,
            buffers,
            registry,
            streams,
            poll,
        }
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn polls_are_single_flight_per_session() {
        let h = harness();
        h.streams.set_online(true);
        h.registry.open("s1");
        h.api.set_tail("s1", "tail");
        h.api.set_tail_delay(Some(Duration::from_secs(3)));

        assert_eq!(h.poll.tick(), 1);
        tokio::task::yield_now().await;
        assert!(h.poll.in_flight("s1"));
        assert_eq!(h.poll.tick(), 0);
        assert_eq!(h.poll.tick(), 0);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.api.tail_calls("s1"), 1);
        assert!(!h.poll.in_flight("s1"));
        assert_eq!(h.buffers.get("s1").as_deref(), Some("tail"));
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn live_sessions_are_not_polled() {
        let h = harness();
        h.streams.set_online(true);
        h.registry.open("s1");
        h.streams.open("s1");
        let _server = h.connector.next_connection().await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(h.poll.tick(), 0);
        assert_eq!(h.api.tail_calls("s1"), 0);
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn nothing_polls_offline() {
        let h = harness();
        h.registry.open("s1");
        assert_eq!(h.poll.tick(), 0);
        h.poll.ensure_running();
        assert!(!h.poll.is_running());
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn driver_stops_when_last_session_closes() {
        let h = harness();
        h.streams.set_online(true);
        h.connector.refuse_all("s1", true);
        h.registry.open("s1");
        h.api.set_tail("s1", "v1");
        h.poll.ensure_running();
        assert!(h.poll.is_running());

        sleep(Duration::from_millis(4_500)).await;
        assert_eq!(h.api.tail_calls("s1"), 3);

        h.registry.hide("s1");
        sleep(Duration::from_secs(3)).await;
        assert!(!h.poll.is_running());
        assert_eq!(h.api.tail_calls("s1"), 3);
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn driver_idles_while_every_session_is_live() {
        let h = harness();
        h.streams.set_online(true);
        h.registry.open("s1");
        h.poll.ensure_running();
        assert!(h.poll.is_running());

        h.streams.open("s1");
        let mut server = h.connector.next_connection().await;
        sleep(Duration::from_secs(3)).await;
        assert!(!h.poll.is_running());
        h.poll.ensure_running();
        assert!(!h.poll.is_running());

        server.disconnect();
        sleep(Duration::from_millis(10)).await;
        assert!(h.poll.has_work());
        h.poll.ensure_running();
        assert!(h.poll.is_running());
        h.poll.stop();
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn late_poll_does_not_overwrite_live_stream() {
        let h = harness();
        h.streams.set_online(true);
        h.registry.open("s1");
        h.api.set_tail("s1", "old tail");
        h.api.set_tail_delay(Some(Duration::from_secs(1)));
        assert_eq!(h.poll.tick(), 1);

        h.streams.open("s1");
        let server = h.connector.next_connection().await;
        server.send_snapshot("fresh");
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.buffers.get("s1").as_deref(), Some("fresh"));
    }
}
