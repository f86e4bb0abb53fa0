//! Metric instrument factories for chainwork.
//!
//! Instruments come from the global `"chainwork"` meter, so they are no-ops
//! until [`init_telemetry`](super::init_telemetry) installs an exporter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for chainwork instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("chainwork")
}

/// Counter: continuation admissions.
/// Labels: `policy` ("none" | "keep" | "replace" | "append"),
/// `result` ("enqueued" | "kept" | "replaced" | "appended").
pub fn work_admitted() -> Counter<u64> {
    meter()
        .u64_counter("chainwork.work.admitted")
        .with_description("Number of continuations admitted")
        .build()
}

/// Counter: work unit state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("chainwork.work.state_transitions")
        .with_description("Number of work unit state transitions")
        .build()
}

/// Counter: retries scheduled after an executable asked for one.
/// Labels: `kind`.
pub fn work_retries() -> Counter<u64> {
    meter()
        .u64_counter("chainwork.work.retries")
        .with_description("Number of retries scheduled")
        .build()
}

/// Histogram: executable run time in milliseconds.
/// Labels: `kind`, `result` ("success" | "failure" | "retry").
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("chainwork.execution.duration_ms")
        .with_description("Executable run time in milliseconds")
        .with_unit("ms")
        .build()
}
