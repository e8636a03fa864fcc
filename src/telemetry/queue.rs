//! Queue span helpers.
//!
//! Every dispatch pass runs inside a `queue.dispatch` span whose result
//! fields are filled in once the pass finishes.

use tracing::Span;

/// Start a span for one dispatch pass.
///
/// The result fields are declared empty and filled by [`record_pass`].
pub fn dispatch_span(queue: &str) -> Span {
    tracing::debug_span!(
        "queue.dispatch",
        "queue.name" = queue,
        "dispatch.visited" = tracing::field::Empty,
        "dispatch.delivered" = tracing::field::Empty,
        "dispatch.lost" = tracing::field::Empty,
    )
}

/// Record the outcome of a pass on its span.
pub fn record_pass(span: &Span, visited: usize, delivered: usize, lost: usize) {
    span.record("dispatch.visited", visited as u64);
    span.record("dispatch.delivered", delivered as u64);
    span.record("dispatch.lost", lost as u64);
}

/// Record a subscriber lifecycle event scoped to the queue.
pub fn record_subscriber_event(queue: &str, subscriber: &str, event: &str) {
    let span = tracing::info_span!("queue.subscriber", "queue.name" = queue);
    span.in_scope(|| {
        tracing::info!(subscriber, event, "subscriber_event");
    });
}
