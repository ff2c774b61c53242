use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter, Encoder, IntCounter, TextEncoder};

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_connections_total",
        "Total number of client connections"
    ))
    .unwrap()
});

pub static FRAMES_REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_frames_rejected_total",
        "Frames rejected by the authorizer"
    ))
    .unwrap()
});

pub static MESSAGES_PUBLISHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_messages_published_total",
        "Messages handed to the broker"
    ))
    .unwrap()
});

pub static PUBLISH_CONFIRMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_publish_confirmed_total",
        "Broker publish confirmations"
    ))
    .unwrap()
});

pub static PUBLISH_REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_publish_rejected_total",
        "Broker publish negative confirmations"
    ))
    .unwrap()
});

pub static PUBLISH_RETURNED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_publish_returned_total",
        "Unroutable publishes returned by the broker"
    ))
    .unwrap()
});

pub static DELIVERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_deliveries_total",
        "Broker deliveries pulled by consumer workers"
    ))
    .unwrap()
});

pub static DELIVERY_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_delivery_retries_total",
        "Delivery handler retries"
    ))
    .unwrap()
});

pub static DEAD_LETTERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_dead_lettered_total",
        "Messages republished to the dead-letter exchange"
    ))
    .unwrap()
});

pub static SESSIONS_EVICTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_sessions_evicted_total",
        "Sessions evicted by the per-principal cap"
    ))
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
