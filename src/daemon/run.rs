//! Daemon runner (single-binary mode).
//!
//! `ripple daemon run` starts the background service in the current process
//! and blocks until SIGTERM/SIGINT.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::server::Server;
use crate::config::Config;
use crate::error::ServerError;
use crate::{Result, paths};

/// Metadata written next to the socket for diagnostics and version checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub version: String,
    pub pid: u32,
}

/// Run the daemon in the current process.
///
/// Does not return until a shutdown signal is received. If another daemon is
/// already listening on the socket, exits quietly.
pub fn run_daemon(socket_override: Option<PathBuf>, config: Config) -> Result<()> {
    let socket = match socket_override {
        Some(path) => path,
        None => {
            paths::ensure_runtime_dir().map_err(ServerError::Io)?;
            paths::socket_path()
        }
    };

    let server = match Server::bind(&socket, config) {
        Ok(server) => server,
        Err(ServerError::AlreadyRunning { path }) => {
            tracing::info!(socket = %path.display(), "daemon already running");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let handle = server.handle();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, handle.shutdown_flag());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, handle.shutdown_flag());

    let meta_path = write_meta(&socket);

    let result = server.run();

    if let Some(meta) = meta_path {
        let _ = fs::remove_file(meta);
    }

    result.map_err(Into::into)
}

fn write_meta(socket: &std::path::Path) -> Option<PathBuf> {
    let meta_path = socket.parent()?.join("daemon.meta.json");
    let info = DaemonInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
    };
    let bytes = serde_json::to_vec(&info).unwrap_or_else(|_| b"{}".to_vec());
    if let Err(err) = fs::write(&meta_path, bytes) {
        tracing::warn!("failed to write daemon metadata: {err}");
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&meta_path, fs::Permissions::from_mode(0o600));
    }
    Some(meta_path)
}
