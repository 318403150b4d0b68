use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, TextEncoder};

static EVENTS_FIRED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("push_events_fired_total", "Events accepted by the event manager"),
        &["scope"],
    )
    .expect("failed to create push_events_fired_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_events_fired_total");
    counter
});

static EVENTS_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("push_events_dropped_total", "Events dropped before dispatch"),
        &["reason"],
    )
    .expect("failed to create push_events_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_events_dropped_total");
    counter
});

static EVENTS_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "push_events_delivered_total",
        "Event frames handed to local queues",
    )
    .expect("failed to create push_events_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_events_delivered_total");
    counter
});

static QUEUES_EVICTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "push_queues_evicted_total",
        "Queues removed after a failed dispatch",
    )
    .expect("failed to create push_queues_evicted_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_queues_evicted_total");
    counter
});

static DIRECTORY_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "push_directory_failures_total",
            "Shared directory store operations that failed",
        ),
        &["op"],
    )
    .expect("failed to create push_directory_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_directory_failures_total");
    counter
});

static BUS_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "push_bus_failures_total",
            "Event bus subscribe failures and lost subscriptions",
        ),
        &["op"],
    )
    .expect("failed to create push_bus_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_bus_failures_total");
    counter
});

static BUS_FALLBACK_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "push_bus_fallback_total",
            "Events delivered to local queues without the event bus",
        ),
        &["reason"],
    )
    .expect("failed to create push_bus_fallback_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_bus_fallback_total");
    counter
});

static ACTIVE_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("push_active_connections", "Open push connections on this node"),
        &["transport"],
    )
    .expect("failed to create push_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register push_active_connections");
    gauge
});

pub fn record_event_fired(scope: &str) {
    EVENTS_FIRED_TOTAL.with_label_values(&[scope]).inc();
}

pub fn record_event_dropped(reason: &str) {
    EVENTS_DROPPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_events_delivered(count: usize) {
    EVENTS_DELIVERED_TOTAL.inc_by(count as u64);
}

pub fn record_queue_evicted() {
    QUEUES_EVICTED_TOTAL.inc();
}

pub fn record_directory_failure(op: &str) {
    DIRECTORY_FAILURES_TOTAL.with_label_values(&[op]).inc();
}

pub fn record_bus_failure(op: &str) {
    BUS_FAILURES_TOTAL.with_label_values(&[op]).inc();
}

pub fn record_bus_fallback(reason: &str) {
    BUS_FALLBACK_TOTAL.with_label_values(&[reason]).inc();
}

pub fn connection_opened(transport: &str) {
    ACTIVE_CONNECTIONS.with_label_values(&[transport]).inc();
}

pub fn connection_closed(transport: &str) {
    ACTIVE_CONNECTIONS.with_label_values(&[transport]).dec();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
