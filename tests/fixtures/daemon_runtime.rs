#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use ripple_rs::Metrics;
use ripple_rs::config::Config;
use ripple_rs::daemon::{Server, ServerHandle};

/// Config tuned for fast tests: short debounce, quick reconnects.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.debounce_ms = 60;
    config.write_deadline_ms = 500;
    config.backoff_base_ms = 100;
    config.backoff_max_ms = 800;
    config
}

/// An in-process daemon on a tempdir-scoped socket.
pub struct DaemonFixture {
    _runtime_dir: TempDir,
    socket: PathBuf,
    config: Config,
    handle: ServerHandle,
    metrics: Arc<Metrics>,
    join: Option<JoinHandle<()>>,
}

impl DaemonFixture {
    pub fn start() -> Self {
        Self::start_with_config(test_config())
    }

    pub fn start_with_config(config: Config) -> Self {
        let runtime_dir = TempDir::new().expect("create runtime dir");
        let socket = runtime_dir.path().join("daemon.sock");
        let (handle, metrics, join) = spawn_server(&socket, config.clone());
        Self {
            _runtime_dir: runtime_dir,
            socket,
            config,
            handle,
            metrics,
            join: Some(join),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Best-effort shutdown. Idempotent.
    pub fn shutdown(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Stop the daemon and bring a fresh one up on the same socket path.
    pub fn restart(&mut self) {
        self.shutdown();
        let (handle, metrics, join) = spawn_server(&self.socket, self.config.clone());
        self.handle = handle;
        self.metrics = metrics;
        self.join = Some(join);
    }
}

impl Drop for DaemonFixture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_server(
    socket: &Path,
    config: Config,
) -> (ServerHandle, Arc<Metrics>, JoinHandle<()>) {
    let server = Server::bind(socket, config).expect("bind daemon socket");
    let handle = server.handle();
    let metrics = server.metrics();
    let join = std::thread::spawn(move || {
        let _ = server.run();
    });
    (handle, metrics, join)
}

/// Poll with capped backoff until the condition holds or the timeout runs out.
pub fn poll_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(backoff);
        backoff = std::cmp::min(backoff.saturating_mul(2), Duration::from_millis(50));
    }
    condition()
}
