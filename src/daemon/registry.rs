//! Connection registry: the daemon's only shared mutable state.

use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::metrics::Metrics;
use crate::protocol::{Envelope, Scope, write_envelope};

/// One accepted socket.
///
/// Mutated by its own reader thread and by the broadcaster; writes serialize
/// through the stream mutex so a peer never observes interleaved documents.
pub(crate) struct Connection {
    id: u64,
    stream: Mutex<UnixStream>,
    scope: AtomicU64,
    last_seen: Mutex<Instant>,
    closed: AtomicBool,
}

impl Connection {
    fn new(id: u64, stream: UnixStream) -> Self {
        Self {
            id,
            stream: Mutex::new(stream),
            scope: AtomicU64::new(Scope::ALL.0),
            last_seen: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn scope(&self) -> Scope {
        Scope(self.scope.load(Ordering::Relaxed))
    }

    pub(crate) fn set_scope(&self, scope: Scope) {
        self.scope.store(scope.0, Ordering::Relaxed);
    }

    /// Record traffic from this peer.
    pub(crate) fn touch(&self) {
        *self.last_seen.lock().expect("last_seen lock poisoned") = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .expect("last_seen lock poisoned")
            .elapsed()
    }

    /// Write one envelope to this peer under the write deadline.
    pub(crate) fn send(&self, envelope: &Envelope, deadline: Duration) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ProtocolError::Disconnected);
        }
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| ProtocolError::Disconnected)?;
        write_envelope(&mut stream, envelope, deadline)
    }

    /// Close both halves; wakes the reader thread blocked on this socket.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

pub(crate) struct ConnectionRegistry {
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub(crate) fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Register an accepted socket with the default wildcard scope.
    pub(crate) fn register(&self, stream: UnixStream) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, stream));
        self.connections
            .write()
            .expect("registry lock poisoned")
            .insert(id, Arc::clone(&conn));
        self.metrics.record_connection_opened();
        conn
    }

    /// Remove and close a connection. Safe to call twice.
    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        let removed = self
            .connections
            .write()
            .expect("registry lock poisoned")
            .remove(&id);
        if let Some(conn) = &removed {
            conn.close();
            self.metrics.record_connection_closed();
        }
        removed
    }

    pub(crate) fn set_scope(&self, id: u64, scope: Scope) -> bool {
        let connections = self.connections.read().expect("registry lock poisoned");
        match connections.get(&id) {
            Some(conn) => {
                conn.set_scope(scope);
                true
            }
            None => false,
        }
    }

    /// Copy of the live connection set; callers never touch the map itself,
    /// and no lock is held while they do I/O on the result.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .len()
    }

    pub(crate) fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write().expect("registry lock poisoned");
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.close();
            self.metrics.record_connection_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_envelopes;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(Metrics::new()))
    }

    #[test]
    fn register_defaults_to_wildcard_scope() {
        let registry = registry();
        let (local, _remote) = UnixStream::pair().unwrap();
        let conn = registry.register(local);
        assert_eq!(conn.scope(), Scope::ALL);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn set_scope_narrows_subscription() {
        let registry = registry();
        let (local, _remote) = UnixStream::pair().unwrap();
        let conn = registry.register(local);
        assert!(registry.set_scope(conn.id(), Scope(7)));
        assert_eq!(conn.scope(), Scope(7));
        assert!(!registry.set_scope(9999, Scope(1)));
    }

    #[test]
    fn remove_is_idempotent_and_closes() {
        let registry = registry();
        let (local, _remote) = UnixStream::pair().unwrap();
        let conn = registry.register(local);
        let id = conn.id();
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(conn.is_closed());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn send_after_close_is_rejected() {
        let registry = registry();
        let (local, _remote) = UnixStream::pair().unwrap();
        let conn = registry.register(local);
        conn.close();
        let err = conn
            .send(&Envelope::ping(), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Disconnected));
    }

    #[test]
    fn send_leaves_no_write_deadline_behind() {
        let registry = registry();
        let (local, remote) = UnixStream::pair().unwrap();
        let conn = registry.register(local);

        conn.send(&Envelope::ping(), Duration::from_millis(100))
            .unwrap();
        {
            let stream = conn.stream.lock().unwrap();
            assert_eq!(stream.write_timeout().unwrap(), None);
        }

        let received = read_envelopes(remote).next().unwrap().unwrap();
        assert_eq!(received, Envelope::ping());
    }
}
