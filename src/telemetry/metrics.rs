//! Metric instrument factories for jobq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: jobs accepted by a queue.
/// Labels: `queue`, `mode`.
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.enqueued")
        .with_description("Number of jobs accepted by a queue")
        .build()
}

/// Counter: jobs pushed to a subscriber.
/// Labels: `queue`, `mode`.
pub fn jobs_delivered() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.delivered")
        .with_description("Number of jobs pushed to subscribers")
        .build()
}

/// Counter: jobs acknowledged by the subscriber holding them.
/// Labels: `queue`.
pub fn jobs_acked() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.acked")
        .with_description("Number of acknowledged jobs")
        .build()
}

/// Counter: acks that named an unknown or foreign job, or an unknown queue.
/// Labels: `queue`, `kind`.
pub fn protocol_errors() -> Counter<u64> {
    meter()
        .u64_counter("jobq.protocol_errors")
        .with_description("Number of rejected acknowledgments")
        .build()
}

/// Counter: jobs lost because a push to the subscriber failed.
/// Labels: `queue`.
pub fn delivery_failures() -> Counter<u64> {
    meter()
        .u64_counter("jobq.delivery_failures")
        .with_description("Number of jobs lost to failed pushes")
        .build()
}

/// Counter: dispatch passes.
/// Labels: `queue`, `outcome` ("delivered" | "idle").
pub fn dispatch_passes() -> Counter<u64> {
    meter()
        .u64_counter("jobq.dispatch.passes")
        .with_description("Number of dispatch passes")
        .build()
}

/// Histogram: dispatch pass duration in milliseconds.
/// Labels: `queue`.
pub fn dispatch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.dispatch.duration_ms")
        .with_description("Dispatch pass duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Common `queue` label.
pub fn queue_label(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}
