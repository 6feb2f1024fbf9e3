use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static LIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "tide_live_streams",
        "Sessions with a connected, authenticated stream",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static OPEN_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("tide_open_sessions", "Sessions currently open in the client").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static PING_LATENCY_MS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "tide_ping_latency_ms",
        "Round-trip latency of the last successful health ping",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static RECONNECT_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tide_reconnect_attempts_total",
        "Reconnect attempts scheduled after unplanned stream closes",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FRAMES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tide_frames_dropped_total",
            "Stream frames dropped as protocol violations",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tide_polls_total", "Tail polls issued by the poll fallback"),
        &["result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tide_commands_total", "Queued command lifecycle outcomes"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_touched_metrics() {
        COMMANDS.with_label_values(&["queued"]).inc();
        LIVE_STREAMS.set(0);
        let text = render();
        assert!(text.contains("tide_commands_total"));
        assert!(text.contains("tide_live_streams"));
    }
}
