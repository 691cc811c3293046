//! `endo-worker`: a worker process. The daemon holds the other end of
//! stdin/stdout; logs go to stderr, which the daemon appends to the
//! worker's log file.

use std::io;
use std::path::PathBuf;

use clap::Parser;

use endo_daemon::config::{self, LoggingConfig};
use endo_daemon::core::FormulaId;
use endo_daemon::daemon::cancel::CancelToken;
use endo_daemon::daemon::session::{SessionOptions, Transport};
use endo_daemon::telemetry;
use endo_daemon::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "endo-worker", version, about = "Run one daemon worker")]
struct Args {
    /// Formula id of the worker.
    id: FormulaId,
    state: PathBuf,
    ephemeral: PathBuf,
    cache: PathBuf,
    /// The daemon's socket.
    sock: PathBuf,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    let cfg = config::load_or_default(None);

    let logging = LoggingConfig {
        stdout: true,
        ..cfg.logging.clone()
    };
    let _telemetry_guard = telemetry::init(telemetry::TelemetryConfig::new(
        args.verbose,
        logging,
        args.state.clone(),
    ));

    let span = tracing::info_span!("worker", worker = %args.id.number().short());
    let _entered = span.enter();
    tracing::info!(state = %args.state.display(), sock = %args.sock.display(), "worker started");

    let transport = Transport::from_parts(io::stdin(), io::stdout(), || {});
    let options = SessionOptions::named(format!("worker-{}", args.id.number().short()))
        .with_max_frame_bytes(cfg.limits.max_frame_bytes);
    let reason = run_worker(transport, &CancelToken::new(), options);
    tracing::info!(reason = %reason, "worker exited");
}
