//! Listener setup, accept loop, and per-connection reader threads.

use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use super::broadcaster::run_broadcast_loop;
use super::liveness::run_liveness_loop;
use super::registry::{Connection, ConnectionRegistry};
use crate::config::Config;
use crate::error::{ProtocolError, ServerError};
use crate::metrics::Metrics;
use crate::protocol::{Envelope, Event, read_envelopes};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// The daemon: owns the listening socket, the connection registry, the
/// broadcaster, and the liveness monitor. No process-wide singleton; drop it
/// and everything it owns goes away.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    registry: Arc<ConnectionRegistry>,
    delivery_tx: Sender<Event>,
    delivery_rx: Receiver<Event>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    config: Config,
}

/// Cancellation handle for a running server; cheap to clone around.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the server to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// The raw flag, for wiring up signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

impl Server {
    /// Bind the listening socket.
    ///
    /// The parent directory is created user-private if missing. A stale
    /// socket file with nothing listening behind it is removed and rebound;
    /// a live one means another daemon owns this path.
    pub fn bind(socket_path: &Path, config: Config) -> Result<Server, ServerError> {
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
            }
        }

        if socket_path.exists() {
            match UnixStream::connect(socket_path) {
                Ok(_) => {
                    return Err(ServerError::AlreadyRunning {
                        path: socket_path.to_path_buf(),
                    });
                }
                Err(_) => {
                    tracing::info!(path = %socket_path.display(), "removing stale socket");
                    fs::remove_file(socket_path)?;
                }
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| ServerError::Bind {
            path: socket_path.to_path_buf(),
            source: e,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600));
        }
        // Non-blocking so the accept loop can observe shutdown.
        listener.set_nonblocking(true)?;

        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&metrics)));
        let (delivery_tx, delivery_rx) = crossbeam::channel::unbounded::<Event>();

        Ok(Server {
            listener,
            socket_path: socket_path.to_path_buf(),
            registry,
            delivery_tx,
            delivery_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics,
            config,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the shutdown flag is set, then tear down:
    /// close every connection, drain the broadcaster, remove the socket file.
    pub fn run(self) -> Result<(), ServerError> {
        let write_deadline = self.config.write_deadline();

        let broadcaster = {
            let registry = Arc::clone(&self.registry);
            let metrics = Arc::clone(&self.metrics);
            let rx = self.delivery_rx.clone();
            std::thread::spawn(move || run_broadcast_loop(rx, registry, metrics, write_deadline))
        };

        let liveness = {
            let registry = Arc::clone(&self.registry);
            let shutdown = Arc::clone(&self.shutdown);
            let interval = self.config.liveness_interval();
            let timeout = self.config.liveness_timeout();
            std::thread::spawn(move || {
                run_liveness_loop(registry, shutdown, interval, timeout, write_deadline)
            })
        };

        tracing::info!(socket = %self.socket_path.display(), "daemon listening");

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.spawn_connection(stream, write_deadline) {
                        tracing::warn!("failed to set up connection: {err}");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                }
            }
        }

        tracing::info!("shutting down");

        // Closing the sockets wakes every reader thread; once they exit, all
        // delivery senders are gone and the broadcaster drains out.
        self.registry.close_all();
        drop(self.delivery_tx);
        let _ = broadcaster.join();
        let _ = liveness.join();

        // Idempotent cleanup: the file may already be gone.
        let _ = fs::remove_file(&self.socket_path);
        tracing::info!("daemon stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: UnixStream, write_deadline: Duration) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        let reader_stream = stream.try_clone()?;
        let conn = self.registry.register(stream);
        tracing::debug!(conn = conn.id(), "connection accepted");

        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);
        let delivery_tx = self.delivery_tx.clone();
        std::thread::spawn(move || {
            run_connection_reader(
                conn,
                reader_stream,
                registry,
                delivery_tx,
                metrics,
                write_deadline,
            )
        });
        Ok(())
    }
}

/// Decode envelopes from one peer until it goes away.
///
/// A malformed document is dropped and the connection lives on; an IO error
/// or EOF deregisters the connection.
fn run_connection_reader(
    conn: Arc<Connection>,
    stream: UnixStream,
    registry: Arc<ConnectionRegistry>,
    delivery_tx: Sender<Event>,
    metrics: Arc<Metrics>,
    write_deadline: Duration,
) {
    for item in read_envelopes(stream) {
        conn.touch();
        match item {
            Ok(Envelope::Subscribe(sub)) => {
                tracing::debug!(conn = conn.id(), scope = %sub.scope, "subscription updated");
                registry.set_scope(conn.id(), sub.scope);
            }
            Ok(Envelope::Ping(_)) => {
                if let Err(err) = conn.send(&Envelope::pong(), write_deadline) {
                    tracing::debug!(conn = conn.id(), "pong failed: {err}");
                    break;
                }
            }
            Ok(Envelope::Pong(_)) => {
                // touch() above is the whole point.
            }
            Ok(Envelope::Event(event)) => {
                metrics.record_event_received();
                if delivery_tx.send(event).is_err() {
                    break;
                }
            }
            Err(ProtocolError::Parse(err)) => {
                tracing::warn!(conn = conn.id(), "dropping malformed document: {err}");
            }
            Err(_) => break,
        }
    }

    tracing::debug!(conn = conn.id(), "connection closed");
    registry.remove(conn.id());
}
