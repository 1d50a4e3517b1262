//! Span helpers for units of work run off the control queues.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one invocation (a lease pass or a populate run).
///
/// The `pass.tag` field is declared empty; lease passes fill it in once the
/// tag filter is chosen.
pub fn start_pass_span(kind: &str, pass_id: &Uuid) -> Span {
    tracing::info_span!(
        "pullq.pass",
        "pass.kind" = kind,
        "pass.id" = %pass_id,
        "pass.tag" = tracing::field::Empty,
    )
}

/// Record the tag filter a pass settled on.
pub fn record_tag(span: &Span, tag: &str) {
    span.record("pass.tag", tag);
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
