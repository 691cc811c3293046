//! A daemon in a temp directory, driven over socket pairs.

use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use endo_daemon::config::Config;
use endo_daemon::daemon::{CancelReason, CancelToken, Daemon, DaemonClient, DaemonOptions, WorkerSettings};
use endo_daemon::paths::DaemonPaths;
use endo_daemon::worker::InProcessLauncher;

pub const MAX_FRAME_BYTES: usize = 1 << 20;

pub struct DaemonRig {
    pub dir: TempDir,
    pub root: CancelToken,
    pub daemon: Arc<Daemon>,
}

impl DaemonRig {
    pub fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = CancelToken::new();
        let daemon = Daemon::start(options(&dir), &root).expect("start daemon");
        Self { dir, root, daemon }
    }

    /// Stop this daemon and start a new one over the same state.
    pub fn restart(&mut self) {
        self.daemon.shutdown(CancelReason::shutdown("restart"));
        self.root = CancelToken::new();
        self.daemon = Daemon::start(options(&self.dir), &self.root).expect("restart daemon");
    }

    pub fn paths(&self) -> DaemonPaths {
        DaemonPaths::rooted(self.dir.path())
    }

    pub fn client(&self) -> DaemonClient {
        let (ours, theirs) = UnixStream::pair().expect("socket pair");
        self.daemon.serve_client(theirs).expect("serve client");
        DaemonClient::from_stream(ours, MAX_FRAME_BYTES).expect("client")
    }

    /// Accept peer connections on an ephemeral port. Returns `tcp://addr`.
    pub fn listen_for_peers(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let daemon = Arc::clone(&self.daemon);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let daemon = Arc::clone(&daemon);
                thread::spawn(move || {
                    let _ = daemon.serve_peer(stream);
                });
            }
        });
        format!("tcp://{addr}")
    }
}

impl Drop for DaemonRig {
    fn drop(&mut self) {
        self.daemon.shutdown(CancelReason::shutdown("test finished"));
    }
}

fn options(dir: &TempDir) -> DaemonOptions {
    DaemonOptions {
        paths: DaemonPaths::rooted(dir.path()),
        settings: WorkerSettings {
            grace_period: Duration::from_secs(2),
            max_frame_bytes: MAX_FRAME_BYTES,
        },
        max_sessions: 64,
        listen_addr: None,
        launcher: Arc::new(InProcessLauncher),
    }
}

/// Config whose every path lives under `dir`.
pub fn rooted_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    let paths = DaemonPaths::rooted(dir.path());
    config.paths.state = Some(paths.state);
    config.paths.ephemeral_state = Some(paths.ephemeral);
    config.paths.cache = Some(paths.cache);
    config.paths.sock = Some(paths.sock);
    config.logging.stdout = false;
    config
}

pub fn sock_path(dir: &TempDir) -> PathBuf {
    DaemonPaths::rooted(dir.path()).sock
}
