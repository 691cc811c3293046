//! `endod`: the capability daemon.

use std::path::PathBuf;

use clap::Parser;

use endo_daemon::daemon::run_daemon;
use endo_daemon::paths::DaemonPaths;
use endo_daemon::{config, telemetry};

#[derive(Parser, Debug)]
#[command(name = "endod", version, about = "Run the capability daemon")]
struct Args {
    /// Config file layered over the user config.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let cfg = match config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let mut logging = cfg.logging.clone();
    telemetry::apply_daemon_logging_defaults(&mut logging);
    let log_dir = DaemonPaths::resolve(&cfg.paths).log_dir();
    let _telemetry_guard = telemetry::init(telemetry::TelemetryConfig::new(
        args.verbose,
        logging,
        log_dir,
    ));

    if let Err(e) = run_daemon(&cfg) {
        tracing::error!("daemon failed: {e}");
        std::process::exit(1);
    }
}
