use ripple_rs::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let _telemetry_guard = init_tracing(&cli);

    if let Err(e) = cli::run(cli) {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(cli: &cli::Cli) -> telemetry::TelemetryGuard {
    let mut config = config::load_or_default();
    if matches!(
        &cli.command,
        cli::Commands::Daemon {
            command: cli::DaemonCommands::Run
        }
    ) {
        telemetry::apply_daemon_logging_defaults(&mut config.logging);
    }
    let verbosity = if cli.quiet { 0 } else { cli.verbose.max(1) };
    telemetry::init(verbosity, &config.logging)
}
