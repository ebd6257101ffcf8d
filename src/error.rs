use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

// =============================================================================
// ProtocolError
// =============================================================================

/// Wire-level errors on an established connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("peer disconnected")]
    Disconnected,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Parse(_) => "parse_error",
            ProtocolError::Io(_) => "io_error",
            ProtocolError::Disconnected => "disconnected",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            ProtocolError::Io(_) | ProtocolError::Disconnected => Transience::Retryable,
            ProtocolError::Parse(_) => Transience::Permanent,
        }
    }
}

// =============================================================================
// ConnectError - classified dial failures
// =============================================================================

/// Classified reasons a client could not reach the daemon.
///
/// All of these mean "run without cross-instance sync for now"; `hint()` gives
/// the host application something actionable to show.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("daemon socket not found at {path}")]
    SocketMissing { path: PathBuf },

    #[error("permission denied on daemon socket {path}")]
    PermissionDenied { path: PathBuf },

    #[error("daemon socket {path} exists but nothing is listening")]
    NothingListening { path: PathBuf },

    #[error("connection refused on daemon socket {path}")]
    ConnectionRefused { path: PathBuf },

    #[error("failed to reach daemon at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConnectError {
    /// Map a dial failure into the closed taxonomy.
    pub fn classify(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => ConnectError::SocketMissing { path },
            io::ErrorKind::PermissionDenied => ConnectError::PermissionDenied { path },
            // On a unix socket ECONNREFUSED means a socket file with no
            // accepting process behind it.
            io::ErrorKind::ConnectionRefused if path.exists() => {
                ConnectError::NothingListening { path }
            }
            io::ErrorKind::ConnectionRefused => ConnectError::ConnectionRefused { path },
            _ => ConnectError::Io { path, source: err },
        }
    }

    /// Short, human-actionable advice for the host application to surface.
    pub fn hint(&self) -> &'static str {
        match self {
            ConnectError::SocketMissing { .. } => {
                "the sync daemon is not running; start it with `ripple daemon run`"
            }
            ConnectError::PermissionDenied { .. } => {
                "the socket belongs to another user; check ownership of the runtime directory"
            }
            ConnectError::NothingListening { .. } => {
                "a stale socket file is present; restart the sync daemon"
            }
            ConnectError::ConnectionRefused { .. } => {
                "the sync daemon refused the connection; restart it"
            }
            ConnectError::Io { .. } => "the sync daemon is unreachable; local changes still work",
        }
    }

    pub fn transience(&self) -> Transience {
        // Every dial failure is recoverable: the host keeps working locally
        // and may retry once the daemon is back.
        Transience::Retryable
    }
}

// =============================================================================
// ServerError
// =============================================================================

/// Daemon-side setup and lifecycle errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServerError {
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another daemon is already listening on {path}")]
    AlreadyRunning { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// =============================================================================
// Crate error
// =============================================================================

/// Crate-level convenience error.
///
/// A thin wrapper over the subsystem errors, not a god error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Protocol(e) => e.transience(),
            Error::Connect(e) => e.transience(),
            Error::Server(_) | Error::Config(_) => Transience::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_missing_socket() {
        let err = ConnectError::classify(
            Path::new("/nonexistent/daemon.sock"),
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert!(matches!(&err, ConnectError::SocketMissing { .. }));
        assert!(err.hint().contains("daemon run"));
        assert!(err.transience().is_retryable());
    }

    #[test]
    fn classify_refused_with_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        std::fs::write(&path, b"").unwrap();
        let err = ConnectError::classify(
            &path,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(matches!(err, ConnectError::NothingListening { .. }));
    }

    #[test]
    fn classify_refused_without_file() {
        let err = ConnectError::classify(
            Path::new("/nonexistent/daemon.sock"),
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(matches!(err, ConnectError::ConnectionRefused { .. }));
    }

    #[test]
    fn parse_errors_are_permanent() {
        let parse = serde_json::from_str::<crate::protocol::Envelope>("{").unwrap_err();
        let err = ProtocolError::Parse(parse);
        assert_eq!(err.transience(), Transience::Permanent);
        assert_eq!(err.code(), "parse_error");
    }
}
