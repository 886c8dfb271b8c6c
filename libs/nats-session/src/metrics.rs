//! Session metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered in the default prometheus registry, so `prometheus::gather()`
//! picks them up. Registration only fails on a duplicate name, which is a
//! programming error.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntGauge, register_histogram, register_int_counter,
    register_int_gauge,
};

lazy_static! {
    /// Count of messages delivered to subscriptions
    pub static ref MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        "console_messages_received",
        "count of messages delivered to console subscriptions"
    ).unwrap();

    /// Count of messages published (including requests)
    pub static ref MESSAGES_PUBLISHED: IntCounter = register_int_counter!(
        "console_messages_published",
        "count of messages published by the console"
    ).unwrap();

    /// Count of payloads shown as a byte-count placeholder
    pub static ref PAYLOAD_DECODE_FALLBACKS: IntCounter = register_int_counter!(
        "console_payload_decode_fallbacks",
        "count of payloads that were not valid utf-8 and were replaced by a placeholder"
    ).unwrap();

    /// Count of stats poller ticks skipped because the sample failed
    pub static ref STATS_POLL_FAILURES: IntCounter = register_int_counter!(
        "console_stats_poll_failures",
        "count of latency samples that failed or timed out"
    ).unwrap();

    /// Round-trip latency samples in seconds
    pub static ref RTT_SECONDS: Histogram = register_histogram!(
        "console_rtt_seconds",
        "round-trip latency to the connected server",
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    /// Active subscriptions
    pub static ref ACTIVE_SUBSCRIPTIONS: IntGauge = register_int_gauge!(
        "console_active_subscriptions",
        "number of subscriptions registered in the console session"
    ).unwrap();

    /// Count of key-value changes observed by watchers
    pub static ref KV_CHANGES_OBSERVED: IntCounter = register_int_counter!(
        "console_kv_changes_observed",
        "count of key-value changes delivered by the active watcher"
    ).unwrap();
}

/// Register every console metric, so each one shows up even before it is
/// first touched.
pub fn register_all() {
    lazy_static::initialize(&MESSAGES_RECEIVED);
    lazy_static::initialize(&MESSAGES_PUBLISHED);
    lazy_static::initialize(&PAYLOAD_DECODE_FALLBACKS);
    lazy_static::initialize(&STATS_POLL_FAILURES);
    lazy_static::initialize(&RTT_SECONDS);
    lazy_static::initialize(&ACTIVE_SUBSCRIPTIONS);
    lazy_static::initialize(&KV_CHANGES_OBSERVED);
}

/// Render every registered metric in the prometheus text format.
pub fn render_text() -> Result<String, prometheus::Error> {
    use prometheus::{Encoder, TextEncoder};

    register_all();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
