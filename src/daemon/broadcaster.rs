//! Event fan-out.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;

use super::registry::ConnectionRegistry;
use crate::metrics::Metrics;
use crate::protocol::{Envelope, Event};

/// Drain the delivery queue until every sender is gone.
///
/// Runs on its own thread. A slow or dead peer never stalls delivery to the
/// others: each write is an independent attempt bounded by the write
/// deadline, and a failed write evicts only that connection.
pub(crate) fn run_broadcast_loop(
    events: Receiver<Event>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    write_deadline: Duration,
) {
    while let Ok(event) = events.recv() {
        deliver(&event, &registry, &metrics, write_deadline);
    }
    tracing::debug!("broadcaster stopped");
}

pub(crate) fn deliver(
    event: &Event,
    registry: &ConnectionRegistry,
    metrics: &Metrics,
    write_deadline: Duration,
) {
    for conn in registry.snapshot() {
        if !conn.scope().matches(event.scope) {
            continue;
        }
        match conn.send(&Envelope::Event(event.clone()), write_deadline) {
            Ok(()) => metrics.record_event_sent(),
            Err(err) => {
                tracing::debug!(conn = conn.id(), "evicting peer after write failure: {err}");
                registry.remove(conn.id());
            }
        }
    }
}
