//! Metric instrument factories for shiftlist.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"shiftlist"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for shiftlist instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("shiftlist")
}

/// Counter: claim attempts.
/// Labels: `result` ("ok" | "empty").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("shiftlist.task.claims")
        .with_description("Number of single-unit claims attempted")
        .build()
}

/// Counter: manual counter adjustments.
/// Labels: `operation` ("dec" | "inc").
pub fn adjustments() -> Counter<u64> {
    meter()
        .u64_counter("shiftlist.task.adjustments")
        .with_description("Number of manual remaining-count adjustments")
        .build()
}

/// Counter: rows merged into task lists.
/// Labels: `result` ("added" | "updated").
pub fn merged_rows() -> Counter<u64> {
    meter()
        .u64_counter("shiftlist.task.merged_rows")
        .with_description("Number of article rows merged into task lists")
        .build()
}

/// Counter: history stream operations.
/// Labels: `stream`, `operation` ("record" | "cancel" | "cancel_empty").
pub fn history_operations() -> Counter<u64> {
    meter()
        .u64_counter("shiftlist.history.operations")
        .with_description("Number of history stream operations")
        .build()
}

/// Counter: bulk imports.
/// Labels: `stream`, `mode`, `result` ("ok" | "error").
pub fn imports() -> Counter<u64> {
    meter()
        .u64_counter("shiftlist.import.batches")
        .with_description("Number of bulk import batches")
        .build()
}

/// Counter: transaction retries after serialization conflicts.
pub fn conflict_retries() -> Counter<u64> {
    meter()
        .u64_counter("shiftlist.tx.conflict_retries")
        .with_description("Number of retries after serialization conflicts")
        .build()
}

/// Counter: compensating increments.
/// Labels: `reason` ("step_failed" | "cancelled").
pub fn compensations() -> Counter<u64> {
    meter()
        .u64_counter("shiftlist.task.compensations")
        .with_description("Number of units restored by compensation")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("shiftlist.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
