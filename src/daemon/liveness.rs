//! Liveness monitor: ping idle peers, evict unresponsive ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::registry::ConnectionRegistry;
use crate::protocol::Envelope;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Sweep the registry once per interval until shutdown.
pub(crate) fn run_liveness_loop(
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    timeout: Duration,
    write_deadline: Duration,
) {
    let mut last_sweep = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(SHUTDOWN_POLL);
        if last_sweep.elapsed() < interval {
            continue;
        }
        last_sweep = Instant::now();
        sweep(&registry, interval, timeout, write_deadline);
    }
    tracing::debug!("liveness monitor stopped");
}

/// Ping every connection idle longer than the interval; evict connections
/// that have been silent past the timeout.
pub(crate) fn sweep(
    registry: &ConnectionRegistry,
    interval: Duration,
    timeout: Duration,
    write_deadline: Duration,
) {
    for conn in registry.snapshot() {
        let idle = conn.idle_for();
        if idle >= timeout {
            tracing::info!(
                conn = conn.id(),
                idle_ms = idle.as_millis() as u64,
                "evicting unresponsive peer"
            );
            registry.remove(conn.id());
        } else if idle >= interval
            && let Err(err) = conn.send(&Envelope::ping(), write_deadline)
        {
            tracing::debug!(conn = conn.id(), "evicting peer after failed ping: {err}");
            registry.remove(conn.id());
        }
    }
}
