//! XDG directory helpers for the socket, config, and log locations.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Directory that holds the daemon socket and metadata file.
///
/// Uses `RIPPLE_RUNTIME_DIR` if set, otherwise `$XDG_RUNTIME_DIR/ripple`,
/// then `~/.ripple`.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RIPPLE_RUNTIME_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir).join("ripple");
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ripple")
}

/// Ensure the runtime directory exists and is user-private.
pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    let dir = runtime_dir();
    fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&dir)?.permissions().mode() & 0o777;
        if mode != 0o700 {
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
    }

    Ok(dir)
}

/// The daemon socket path.
///
/// `RIPPLE_SOCKET` overrides the whole path.
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("RIPPLE_SOCKET")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    runtime_dir().join("daemon.sock")
}

/// Daemon metadata file (version, pid), next to the socket.
pub fn meta_path() -> PathBuf {
    runtime_dir().join("daemon.meta.json")
}

/// Base directory for configuration files.
///
/// Uses `RIPPLE_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/ripple` or
/// `~/.config/ripple`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RIPPLE_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("ripple")
}

/// Directory for daemon log files.
pub fn log_dir() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("state")
        })
        .join("ripple")
        .join("logs")
}
