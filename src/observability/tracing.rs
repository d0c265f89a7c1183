//! Span helpers.
//!
//! Every connection worker runs inside one span, so each log line it emits
//! carries the worker name, scheduling class and connection id.

use tracing::Span;

use crate::net::admission::ConnectionSlot;

pub fn connection_span(slot: &ConnectionSlot) -> Span {
    let worker = slot.worker();
    tracing::info_span!(
        "connection",
        connection_id = %slot.id(),
        worker = %worker.name,
        scheduling = worker.scheduling.as_str(),
        principal = tracing::field::Empty,
    )
}

/// Record the resolved principal on the current connection span.
pub fn record_principal(span: &Span, principal: &dyn std::fmt::Display) {
    span.record("principal", tracing::field::display(principal));
}
