use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BOOT_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new("fleet_gateway_boot_total", "gateway boots")).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BUS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_bus_publish_total",
            "bus publishes by channel and outcome",
        ),
        &["channel", "result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PROXY_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_proxy_frames_total",
            "terminal output frames relayed into proxy sessions by outcome",
        ),
        &["result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LOCATION_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_location_lookups_total",
            "agent location lookups by source",
        ),
        &["source"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static WS_OUTBOUND_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "fleet_ws_outbound_dropped_total",
        "bus events dropped because a socket's outbound queue was full",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BROADCAST_WRITE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "fleet_broadcast_write_failures_total",
        "socket writes that failed during a user broadcast",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static WS_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "fleet_ws_connections",
        "websocket connections registered on this instance",
    ))
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn record_publish(channel: &str, ok: bool) {
    BUS_PUBLISHED
        .with_label_values(&[channel, if ok { "ok" } else { "error" }])
        .inc();
}

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}

/// Publish through the bus and count the outcome per channel.
pub async fn publish_counted<T: serde::Serialize + ?Sized>(
    bus: &fleet_bus::MessageBus,
    channel: fleet_bus::Channel,
    kind: &str,
    payload: &T,
) -> fleet_bus::BusResult<usize> {
    let result = bus.publish(channel, kind, payload).await;
    record_publish(channel.as_str(), result.is_ok());
    result
}
