//! Spans around executable runs in the worker pool.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for one execution attempt of a work unit.
///
/// `work.state` starts empty and is filled in by [`record_state_transition`]
/// once the outcome is recorded.
pub fn start_work_span(kind: &str, work_id: &WorkId, attempt: u32) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.kind" = kind,
        "work.id" = %work_id.0,
        "work.attempt" = attempt,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span and fills `work.state`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
