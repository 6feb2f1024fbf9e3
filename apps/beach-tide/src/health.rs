use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, trace};

use crate::metrics;
use crate::registry::SessionRegistry;
use crate::stream::StreamManager;
use crate::transport::SessionApi;

/// Read-only view of connection health.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub live_streams: usize,
    pub open_sessions: usize,
    pub last_latency: Option<Duration>,
    pub last_ping_at: Option<OffsetDateTime>,
    pub consecutive_ping_failures: u32,
}

#[derive(Default)]
struct PingState {
    last_latency: Option<Duration>,
    last_ping_at: Option<OffsetDateTime>,
    consecutive_failures: u32,
}

/// Aggregates stream state and an independent ping. Observes only; nothing
/// here feeds back into retry or polling decisions.
#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<HealthInner>,
}

struct HealthInner {
    api: Arc<dyn SessionApi>,
    streams: StreamManager,
    registry: Arc<SessionRegistry>,
    every: Duration,
    ping: Mutex<PingState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl HealthTracker {
    pub fn new(
        api: Arc<dyn SessionApi>,
        streams: StreamManager,
        registry: Arc<SessionRegistry>,
        every: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                api,
                streams,
                registry,
                every,
                ping: Mutex::new(PingState::default()),
                driver: Mutex::new(None),
            }),
        }
    }

    /// One round trip. Returns the latency on success.
    pub async fn ping_once(&self) -> Option<Duration> {
        let started = Instant::now();
        match self.inner.api.ping().await {
            Ok(()) => {
                let latency = started.elapsed();
                {
                    let mut ping = self.inner.ping.lock();
                    ping.last_latency = Some(latency);
                    ping.last_ping_at = Some(OffsetDateTime::now_utc());
                    ping.consecutive_failures = 0;
                }
                metrics::PING_LATENCY_MS.set(latency.as_millis() as i64);
                trace!(
                    target = "beach_tide::health",
                    latency_ms = latency.as_millis() as u64,
                    "ping ok"
                );
                Some(latency)
            }
            Err(err) => {
                let failures = {
                    let mut ping = self.inner.ping.lock();
                    ping.consecutive_failures = ping.consecutive_failures.saturating_add(1);
                    ping.consecutive_failures
                };
                debug!(
                    target = "beach_tide::health",
                    error = %err,
                    failures,
                    "ping failed"
                );
                None
            }
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let live_streams = self.inner.streams.live_count();
        let open_sessions = self.inner.registry.open_count();
        metrics::LIVE_STREAMS.set(live_streams as i64);
        metrics::OPEN_SESSIONS.set(open_sessions as i64);
        let ping = self.inner.ping.lock();
        HealthSnapshot {
            live_streams,
            open_sessions,
            last_latency: ping.last_latency,
            last_ping_at: ping.last_ping_at,
            consecutive_ping_failures: ping.consecutive_failures,
        }
    }

    /// Ping on the configured interval while online.
    pub fn ensure_running(&self) {
        if !self.inner.streams.is_online() {
            return;
        }
        let mut driver = self.inner.driver.lock();
        if driver.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let tracker = self.clone();
        *driver = Some(tokio::spawn(async move {
            let mut ticker = interval(tracker.inner.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tracker.inner.streams.is_online() {
                    break;
                }
                tracker.ping_once().await;
            }
        }));
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
