//! Process-wide counters for the coordination layer
//!
//! Counters are registered against the default prometheus registry on first
//! use. `encode_metrics` renders everything gathered so far in the text
//! exposition format.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, Encoder, Histogram, IntCounter, TextEncoder,
};

use super::error::{CoordResult, ErrorContext};

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0];

// Callers that joined an operation already in flight
pub(crate) static DEDUP_JOINS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "portalsync_dedup_joins_total",
        "Callers that joined an in-flight deduplicated operation"
    )
    .unwrap()
});

// Underlying operations actually started
pub(crate) static DEDUP_INVOCATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "portalsync_dedup_invocations_total",
        "Deduplicated operations that were actually invoked"
    )
    .unwrap()
});

pub(crate) static BATCH_FLUSHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "portalsync_batch_flushes_total",
        "Batch queues flushed into a combined call"
    )
    .unwrap()
});

pub(crate) static BATCH_SIZE: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "portalsync_batch_size",
        "Items per flushed batch",
        BATCH_SIZE_BUCKETS.to_vec()
    )
    .unwrap()
});

pub(crate) static SCRIPT_INJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "portalsync_script_injections_total",
        "Verification script injection attempts"
    )
    .unwrap()
});

// Loads completed by the grace timer instead of the ready callback
pub(crate) static FORCED_READY: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "portalsync_script_forced_ready_total",
        "Script loads completed by forcing the ready signal"
    )
    .unwrap()
});

pub(crate) static RENDER_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "portalsync_render_timeouts_total",
        "Widget renders that exceeded their timeout"
    )
    .unwrap()
});

/// Encode all gathered metrics in the prometheus text format
pub fn encode_metrics() -> CoordResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .with_context("Failed to encode metrics")?;
    String::from_utf8(buffer).with_context("Metrics are not valid utf-8")
}
