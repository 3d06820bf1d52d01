//! Prometheus metrics for ketch clients.
//!
//! One metric family per client telemetry event:
//! - Connection lifecycle and reconnections
//! - Request correlation latency and timeouts
//! - Rate limiter tokens, queue depth, pressure
//! - Heartbeat probes and round-trips
//! - Pool failover
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Number of currently connected clients.
pub static WS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ketch_ws_connected", "Number of connected clients").unwrap()
});

/// Connection state machine occupancy.
/// Labels: state (connecting/connected/reconnecting/closing/closed)
pub static WS_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ketch_ws_state",
        "Clients currently in each connection state",
        &["state"]
    )
    .unwrap()
});

/// Total reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ketch_ws_reconnect_total",
        "Total reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Correlated request round-trip in milliseconds.
pub static REQUEST_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ketch_request_duration_ms",
        "Correlated request round-trip in milliseconds",
        &["method"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Total correlated requests that timed out.
pub static REQUEST_TIMEOUT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ketch_request_timeout_total",
        "Total correlated requests that timed out",
        &["method"]
    )
    .unwrap()
});

/// Tokens remaining per limiter.
pub static RATE_TOKENS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ketch_rate_tokens",
        "Tokens remaining in each rate limiter bucket",
        &["name"]
    )
    .unwrap()
});

/// Queued sends per limiter.
pub static RATE_QUEUE_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ketch_rate_queue_size",
        "Sends queued behind each rate limiter",
        &["name"]
    )
    .unwrap()
});

/// Total sends rejected because the limiter queue was full.
pub static RATE_QUEUE_FULL_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ketch_rate_queue_full_total",
        "Total sends rejected with a full limiter queue",
        &["name"]
    )
    .unwrap()
});

/// Discretized queue pressure (0=none, 1=low, 2=medium, 3=high).
pub static RATE_PRESSURE_LEVEL: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ketch_rate_pressure_level",
        "Rate limiter pressure level (0=none, 1=low, 2=medium, 3=high)",
        &["name"]
    )
    .unwrap()
});

/// Active subscriptions across all clients.
pub static SUBSCRIPTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ketch_subscriptions_active",
        "Active channel subscriptions across all clients"
    )
    .unwrap()
});

/// Heartbeat probes sent.
pub static HEARTBEAT_SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ketch_heartbeat_sent_total",
        "Heartbeat probes sent",
        &["kind"]
    )
    .unwrap()
});

/// Heartbeat round-trip in milliseconds.
pub static HEARTBEAT_RTT_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ketch_heartbeat_rtt_ms",
        "Heartbeat round-trip in milliseconds",
        &["kind"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0]
    )
    .unwrap()
});

/// Pool failovers during balanced sends.
pub static POOL_FAILOVER_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ketch_pool_failover_total",
        "Failovers during balanced sends",
        &["reason"]
    )
    .unwrap()
});
