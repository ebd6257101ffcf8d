//! CLI surface for ripple.
//!
//! Thin handlers over the client library and daemon runner; the binary is a
//! supervisor convenience, not part of the sync core.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::daemon::{DaemonInfo, run_daemon};
use crate::error::ConnectError;
use crate::protocol::{Envelope, Scope, decode_envelope, encode_envelope};
use crate::{Client, Result, config, paths};

#[derive(Parser, Debug)]
#[command(
    name = "ripple",
    version,
    about = "Local change-notification daemon",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Errors only.
    #[arg(short = 'q', long, global = true, default_value_t = false)]
    pub quiet: bool,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Socket path (default: the per-user runtime directory).
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Daemon lifecycle.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Check whether the daemon is reachable.
    Status,

    /// Publish a one-shot change notification.
    Notify {
        /// Scope to notify (0 = all scopes).
        #[arg(long, default_value_t = 0)]
        scope: u64,
    },

    /// Subscribe and print incoming events as JSON lines.
    Listen {
        /// Scope to subscribe to (0 = all scopes).
        #[arg(long, default_value_t = 0)]
        scope: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Run the daemon in the foreground until SIGTERM/SIGINT.
    Run,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> Result<()> {
    let config = config::load_or_default();
    let socket = cli.socket.clone().unwrap_or_else(paths::socket_path);

    match cli.command {
        Commands::Daemon {
            command: DaemonCommands::Run,
        } => run_daemon(cli.socket, config),
        Commands::Status => status(&socket, &config),
        Commands::Notify { scope } => notify(&socket, config, Scope(scope)),
        Commands::Listen { scope } => listen(&socket, config, Scope(scope)),
    }
}

/// Ping the daemon over a raw connection and report what we find.
fn status(socket: &std::path::Path, config: &config::Config) -> Result<()> {
    let mut stream = match UnixStream::connect(socket) {
        Ok(stream) => stream,
        Err(e) => {
            let err = ConnectError::classify(socket, e);
            eprintln!("daemon unreachable: {err}");
            eprintln!("hint: {}", err.hint());
            return Err(err.into());
        }
    };

    let started = std::time::Instant::now();
    let bytes = encode_envelope(&Envelope::ping()).map_err(crate::Error::from)?;
    stream
        .write_all(&bytes)
        .map_err(|e| crate::Error::from(crate::ProtocolError::Io(e)))?;
    stream
        .set_read_timeout(Some(config.write_deadline()))
        .map_err(|e| crate::Error::from(crate::ProtocolError::Io(e)))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| crate::Error::from(crate::ProtocolError::Io(e)))?;
    match decode_envelope(&line) {
        Ok(Envelope::Pong(_)) => {}
        Ok(other) => {
            eprintln!("unexpected reply: {other:?}");
        }
        Err(e) => return Err(crate::Error::from(e)),
    }

    let rtt = started.elapsed();
    match read_daemon_info() {
        Some(info) => println!(
            "daemon alive (version {}, pid {}, rtt {:?})",
            info.version, info.pid, rtt
        ),
        None => println!("daemon alive (rtt {rtt:?})"),
    }
    Ok(())
}

fn read_daemon_info() -> Option<DaemonInfo> {
    let contents = std::fs::read_to_string(paths::meta_path()).ok()?;
    serde_json::from_str(&contents).ok()
}

fn notify(socket: &std::path::Path, config: config::Config, scope: Scope) -> Result<()> {
    let debounce = config.debounce_window();
    let client = Client::with_config(socket, config)?;
    client.notify(scope);
    // Give the flusher one window to put the event on the wire.
    std::thread::sleep(debounce + Duration::from_millis(50));
    client.shutdown();
    Ok(())
}

fn listen(socket: &std::path::Path, config: config::Config, scope: Scope) -> Result<()> {
    let client = Client::with_config(socket, config)?;
    client.subscribe(scope);

    let stop = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop));

    let events = client.listen();
    while !stop.load(Ordering::Relaxed) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let json = serde_json::to_string(&event)
                    .unwrap_or_else(|_| format!("{{\"scope\":{}}}", event.scope));
                println!("{json}");
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    client.shutdown();
    Ok(())
}
