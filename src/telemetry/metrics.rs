//! Metric instrument factories for pullq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"pullq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for pullq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("pullq")
}

/// Counter: queue-level operations (send_batch, read, delete, purge, set_vt).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("pullq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: work items returned by lease calls.
/// Labels: `tag` (empty for match-any).
pub fn items_leased() -> Counter<u64> {
    meter()
        .u64_counter("pullq.items.leased")
        .with_description("Work items leased")
        .build()
}

/// Counter: work items deleted after reaching the lease limit.
/// Labels: `result` ("ok" | "failed").
pub fn items_retired() -> Counter<u64> {
    meter()
        .u64_counter("pullq.items.retired")
        .with_description("Work items retired after reaching the lease limit")
        .build()
}

/// Counter: invocations placed on a control queue.
/// Labels: `queue`, `kind`.
pub fn invocations_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("pullq.invocations.scheduled")
        .with_description("Invocations scheduled on a control queue")
        .build()
}

/// Counter: invocations that failed and were handed back for retry.
/// Labels: `kind`.
pub fn invocations_failed() -> Counter<u64> {
    meter()
        .u64_counter("pullq.invocations.failed")
        .with_description("Invocations that failed and will be retried")
        .build()
}

/// Histogram: unit-of-work duration in milliseconds.
/// Labels: `kind`.
pub fn pass_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("pullq.pass.duration_ms")
        .with_description("Invocation duration in milliseconds")
        .with_unit("ms")
        .build()
}
