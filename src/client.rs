//! Client library.
//!
//! Gives the host application a two-method surface — `notify(scope)` and
//! `subscribe(scope)` — plus a readable stream of incoming events, hiding
//! the batching and reconnection machinery.

use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};

use crate::config::Config;
use crate::error::{ConnectError, ProtocolError};
use crate::metrics::Metrics;
use crate::protocol::{Envelope, Event, Scope, read_envelopes, write_envelope};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: policy.base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Handle to the daemon for one application instance.
///
/// Cheap to share behind an `Arc`; dropping the last handle stops the
/// background threads.
pub struct Client {
    inner: Arc<ClientInner>,
    events_rx: Receiver<Event>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    socket_path: PathBuf,
    debounce: Duration,
    write_deadline: Duration,
    backoff: BackoffPolicy,
    max_reconnect_attempts: u32,
    stream: Mutex<Option<UnixStream>>,
    pending: Mutex<HashMap<Scope, Event>>,
    desired_scope: AtomicU64,
    sequence: AtomicU64,
    degraded: AtomicBool,
    shutdown: AtomicBool,
    reconnecting: AtomicBool,
    events_tx: Sender<Event>,
    metrics: Arc<Metrics>,
}

impl Client {
    /// Dial the daemon with default settings.
    pub fn connect(socket_path: &Path) -> Result<Client, ConnectError> {
        Client::with_config(socket_path, Config::default())
    }

    /// Dial the daemon, subscribe to all scopes, and start the background
    /// reader and flusher threads.
    pub fn with_config(socket_path: &Path, config: Config) -> Result<Client, ConnectError> {
        let (events_tx, events_rx) =
            crossbeam::channel::bounded::<Event>(config.inbound_queue_capacity);
        let inner = Arc::new(ClientInner {
            socket_path: socket_path.to_path_buf(),
            debounce: config.debounce_window(),
            write_deadline: config.write_deadline(),
            backoff: BackoffPolicy {
                base: config.backoff_base(),
                max: config.backoff_max(),
            },
            max_reconnect_attempts: config.max_reconnect_attempts,
            stream: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            desired_scope: AtomicU64::new(Scope::ALL.0),
            sequence: AtomicU64::new(1),
            degraded: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            events_tx,
            metrics: Arc::new(Metrics::new()),
        });

        establish(&inner)?;

        let flusher = {
            let inner = Arc::clone(&inner);
            std::thread::spawn(move || run_flush_loop(inner))
        };

        Ok(Client {
            inner,
            events_rx,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Queue a change notification for `scope`.
    ///
    /// Never blocks and never fails: repeated notifications for the same
    /// scope within one debounce window coalesce into a single wire event,
    /// and delivery is best-effort by design.
    pub fn notify(&self, scope: Scope) {
        self.inner.note_change(scope);

        // A degraded client is revived by fresh activity.
        if self.inner.degraded.load(Ordering::Relaxed) {
            start_reconnect(&self.inner);
        }
    }

    /// Change the subscribed scope. Re-applied automatically after any
    /// reconnect, so callers set it once.
    pub fn subscribe(&self, scope: Scope) {
        self.inner.desired_scope.store(scope.0, Ordering::Relaxed);
        match self.inner.send_envelope(&Envelope::subscribe(scope)) {
            Ok(()) => {}
            Err(ProtocolError::Io(_)) => on_disconnect(&self.inner),
            // Not connected right now: the reconnect path resubscribes.
            Err(_) => start_reconnect(&self.inner),
        }
    }

    /// The stream of incoming events. FIFO; bounded, so a stalled consumer
    /// loses events rather than memory.
    pub fn listen(&self) -> Receiver<Event> {
        self.events_rx.clone()
    }

    pub fn subscribed_scope(&self) -> Scope {
        Scope(self.inner.desired_scope.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .stream
            .lock()
            .expect("stream lock poisoned")
            .is_some()
    }

    /// True once the reconnect budget is exhausted; the host keeps working
    /// locally without cross-instance sync. Fresh `notify`/`subscribe`
    /// activity restarts the reconnect cycle.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Stop background threads and close the connection. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.drop_stream();
        if let Some(handle) = self.flusher.lock().expect("flusher lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ClientInner {
    /// Coalesce a pending outbound event for this scope.
    fn note_change(&self, scope: Scope) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let event = Event::state_changed(scope, sequence);
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(scope, event);
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let mut guard = self.stream.lock().expect("stream lock poisoned");
        let Some(stream) = guard.as_mut() else {
            return Err(ProtocolError::Disconnected);
        };
        write_envelope(stream, envelope, self.write_deadline)
    }

    fn deliver(&self, event: Event) {
        self.metrics.record_event_received();
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(scope = %event.scope, "inbound queue full, dropping event");
                self.metrics.record_event_dropped();
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn drop_stream(&self) {
        let taken = self.stream.lock().expect("stream lock poisoned").take();
        if let Some(stream) = taken {
            let _ = stream.shutdown(Shutdown::Both);
            self.metrics.record_connection_closed();
        }
    }

    /// Returns true if shutdown was requested mid-sleep.
    fn sleep_observing_shutdown(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.shutdown.load(Ordering::Relaxed) {
                return true;
            }
            let step = std::cmp::min(SHUTDOWN_POLL, remaining);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Dial, resubscribe, and start a reader for the new connection.
fn establish(inner: &Arc<ClientInner>) -> Result<(), ConnectError> {
    let stream = UnixStream::connect(&inner.socket_path)
        .map_err(|e| ConnectError::classify(&inner.socket_path, e))?;
    let reader_stream = stream.try_clone().map_err(|e| ConnectError::Io {
        path: inner.socket_path.clone(),
        source: e,
    })?;

    *inner.stream.lock().expect("stream lock poisoned") = Some(stream);
    inner.metrics.record_connection_opened();

    let scope = Scope(inner.desired_scope.load(Ordering::Relaxed));
    if let Err(err) = inner.send_envelope(&Envelope::subscribe(scope)) {
        inner.drop_stream();
        return Err(ConnectError::Io {
            path: inner.socket_path.clone(),
            source: std::io::Error::other(err.to_string()),
        });
    }

    let reader_inner = Arc::clone(inner);
    std::thread::spawn(move || run_reader(reader_inner, reader_stream));
    Ok(())
}

/// Wake every debounce window and flush at most one event per scope.
fn run_flush_loop(inner: Arc<ClientInner>) {
    while !inner.shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(inner.debounce);
        flush_pending(&inner);
    }
}

fn flush_pending(inner: &Arc<ClientInner>) {
    let drained: Vec<Event> = {
        let mut pending = inner.pending.lock().expect("pending lock poisoned");
        if pending.is_empty() {
            return;
        }
        pending.drain().map(|(_, event)| event).collect()
    };

    for (index, event) in drained.iter().enumerate() {
        match inner.send_envelope(&Envelope::Event(event.clone())) {
            Ok(()) => inner.metrics.record_event_sent(),
            Err(err) => {
                // Put the unsent tail back so it survives the reconnect;
                // newer pending events win over requeued ones.
                {
                    let mut pending = inner.pending.lock().expect("pending lock poisoned");
                    for event in &drained[index..] {
                        pending.entry(event.scope).or_insert_with(|| event.clone());
                    }
                }
                match err {
                    ProtocolError::Io(_) => on_disconnect(inner),
                    _ => start_reconnect(inner),
                }
                return;
            }
        }
    }
}

fn run_reader(inner: Arc<ClientInner>, stream: UnixStream) {
    for item in read_envelopes(stream) {
        if inner.shutdown.load(Ordering::Relaxed) {
            return;
        }
        match item {
            Ok(Envelope::Event(event)) => inner.deliver(event),
            Ok(Envelope::Ping(_)) => {
                if inner.send_envelope(&Envelope::pong()).is_err() {
                    break;
                }
            }
            // The daemon never sends these; tolerate them.
            Ok(Envelope::Subscribe(_)) | Ok(Envelope::Pong(_)) => {}
            Err(ProtocolError::Parse(err)) => {
                tracing::warn!("dropping malformed document: {err}");
            }
            Err(_) => break,
        }
    }
    on_disconnect(&inner);
}

/// Tear down the dead connection and kick off reconnection.
fn on_disconnect(inner: &Arc<ClientInner>) {
    if inner.shutdown.load(Ordering::Relaxed) {
        return;
    }
    inner.drop_stream();
    start_reconnect(inner);
}

fn start_reconnect(inner: &Arc<ClientInner>) {
    if inner.shutdown.load(Ordering::Relaxed) {
        return;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    let inner = Arc::clone(inner);
    std::thread::spawn(move || run_reconnect_loop(inner));
}

/// Retry with exponential backoff (1s, 2s, 4s, 8s, 16s by default), then
/// give up and mark the client degraded.
fn run_reconnect_loop(inner: Arc<ClientInner>) {
    let mut backoff = Backoff::new(inner.backoff);
    for attempt in 1..=inner.max_reconnect_attempts {
        if inner.sleep_observing_shutdown(backoff.next_delay()) {
            inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        inner.metrics.record_reconnect();
        match establish(&inner) {
            Ok(()) => {
                tracing::info!(attempt, "reconnected to daemon");
                backoff.reset();
                inner.degraded.store(false, Ordering::Relaxed);
                inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            Err(err) => {
                tracing::debug!(attempt, "reconnect failed: {err}");
            }
        }
    }

    tracing::warn!(
        attempts = inner.max_reconnect_attempts,
        "daemon unreachable, running without cross-instance sync"
    );
    inner.degraded.store(true, Ordering::Relaxed);
    inner.reconnecting.store(false, Ordering::SeqCst);
}
