//! Daemon runner.
//!
//! `endod` starts the daemon here. Clients connect on the Unix socket and
//! get a session served by the [`DaemonFacet`]; peers connect over TCP,
//! exchange hellos and get a session served by a gateway facet. Every
//! session hangs off the daemon token, so stopping the daemon closes them.

use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::Result;
use crate::config::Config;
use crate::core::NodeId;
use crate::paths::DaemonPaths;

use super::cancel::{CancelReason, CancelToken};
use super::durable::{read_optional, write_once, write_replace};
use super::facet::DaemonFacet;
use super::gateway::{TcpDialer, exchange_hello};
use super::graph::{Graph, GraphOptions};
use super::session::{Session, SessionOptions, Transport};
use super::sync::lock;
use super::worker::{ProcessLauncher, WorkerLauncher, WorkerSettings};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const SESSION_DRAIN: Duration = Duration::from_secs(5);

/// Everything [`Daemon::start`] needs, resolved from [`Config`].
#[derive(Clone)]
pub struct DaemonOptions {
    pub paths: DaemonPaths,
    pub settings: WorkerSettings,
    pub max_sessions: usize,
    pub listen_addr: Option<String>,
    pub launcher: Arc<dyn WorkerLauncher>,
}

impl DaemonOptions {
    pub fn from_config(config: &Config) -> Self {
        let launcher = match &config.worker.program {
            Some(program) => ProcessLauncher::new(program),
            None => ProcessLauncher::sibling_of_current_exe(),
        };
        Self {
            paths: DaemonPaths::resolve(&config.paths),
            settings: WorkerSettings {
                grace_period: Duration::from_millis(config.grace_period_ms),
                max_frame_bytes: config.limits.max_frame_bytes,
            },
            max_sessions: config.limits.max_sessions,
            listen_addr: config.network.listen_addr.clone(),
            launcher: Arc::new(launcher),
        }
    }
}

/// Read the node id, generating and persisting one on first start.
pub fn load_or_create_node_id(paths: &DaemonPaths) -> Result<NodeId> {
    let path = paths.node_id_path();
    if let Some(bytes) = read_optional(&path)? {
        return Ok(NodeId::parse(String::from_utf8_lossy(&bytes).trim())?);
    }
    let node = NodeId::generate();
    if write_once(&path, format!("{node}\n").as_bytes())? {
        tracing::info!(node = node.short(), "node id generated");
        return Ok(node);
    }
    // Lost a race with another writer; theirs wins.
    let bytes = read_optional(&path)?.unwrap_or_default();
    Ok(NodeId::parse(String::from_utf8_lossy(&bytes).trim())?)
}

/// A started daemon: graph, root host and the open sessions.
pub struct Daemon {
    graph: Arc<Graph>,
    root: CancelToken,
    stop: CancelToken,
    settings: WorkerSettings,
    max_sessions: usize,
    sessions: Mutex<HashMap<u64, Session>>,
    next_session: AtomicU64,
}

impl Daemon {
    /// Prepare state directories, the node id and the root host. The daemon
    /// token is a child of `parent`.
    pub fn start(options: DaemonOptions, parent: &CancelToken) -> Result<Arc<Daemon>> {
        let DaemonOptions {
            paths,
            settings,
            max_sessions,
            listen_addr: _,
            launcher,
        } = options;
        paths.ensure_roots()?;
        let node = load_or_create_node_id(&paths)?;
        let root = parent.child();
        let graph = Graph::new(
            GraphOptions {
                node: node.clone(),
                paths,
                launcher,
                dialer: Arc::new(TcpDialer::new(settings.max_frame_bytes)),
                settings,
            },
            &root,
        );
        let host = graph.root_host_id()?;
        tracing::info!(node = node.short(), host = %host, "daemon started");
        Ok(Arc::new(Daemon {
            graph,
            stop: root.child(),
            root,
            settings,
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        }))
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn node(&self) -> &NodeId {
        self.graph.node()
    }

    pub fn paths(&self) -> &DaemonPaths {
        self.graph.paths()
    }

    /// Cancelled by a `terminate` request or [`Daemon::request_stop`].
    pub fn stop_token(&self) -> &CancelToken {
        &self.stop
    }

    pub fn request_stop(&self, reason: CancelReason) {
        self.stop.cancel(reason);
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn track(self: &Arc<Self>, session: &Session) {
        let key = self.next_session.fetch_add(1, Ordering::Relaxed);
        lock(&self.sessions).insert(key, session.clone());
        let weak = Arc::downgrade(self);
        session.closed().on_cancel(move |reason| {
            if let Some(daemon) = weak.upgrade() {
                lock(&daemon.sessions).remove(&key);
                tracing::debug!(session = key, reason = %reason, "session closed");
            }
        });
    }

    fn at_capacity(&self) -> bool {
        self.session_count() >= self.max_sessions
    }

    /// Serve the daemon facet on a client connection.
    pub fn serve_client(self: &Arc<Self>, stream: UnixStream) -> io::Result<Session> {
        let transport = Transport::unix(stream)?;
        let facet = Arc::new(DaemonFacet::new(&self.graph, self.stop.clone()));
        let session = Session::open(
            transport,
            facet,
            &self.root,
            SessionOptions::named("client").with_max_frame_bytes(self.settings.max_frame_bytes),
        );
        if self.at_capacity() {
            tracing::warn!(limit = self.max_sessions, "refusing client: too many sessions");
            session.close(CancelReason::refused("too many sessions"));
            return Ok(session);
        }
        self.track(&session);
        Ok(session)
    }

    /// Greet a peer connection and hand it to remote control. Returns
    /// whether the connection was adopted.
    pub fn serve_peer(self: &Arc<Self>, stream: TcpStream) -> Result<bool> {
        let peer = exchange_hello(&stream, self.node(), self.settings.max_frame_bytes)?;
        let connection = self.root.child();
        let session = Session::open(
            Transport::tcp(stream)?,
            self.graph.gateway_facet(&peer),
            &connection,
            SessionOptions::named(format!("peer-in-{}", peer.short()))
                .with_max_frame_bytes(self.settings.max_frame_bytes),
        );
        self.track(&session);
        Ok(self.graph.accept_peer(&peer, session, &connection))
    }

    /// Let in-flight answers go out, then cancel everything and wait for
    /// the sessions to close.
    pub fn shutdown(&self, reason: CancelReason) {
        let sessions: Vec<Session> = lock(&self.sessions).values().cloned().collect();
        let deadline = Instant::now() + SESSION_DRAIN;
        for session in &sessions {
            let left = deadline.saturating_duration_since(Instant::now());
            if !session.drain(left) {
                tracing::warn!(session = session.name(), "session still busy at shutdown");
            }
        }
        self.stop.cancel(reason.clone());
        self.root.cancel(reason);
        for session in &sessions {
            let left = deadline.saturating_duration_since(Instant::now());
            session.closed().wait_timeout(left);
        }
        tracing::info!(sessions = sessions.len(), "daemon stopped");
    }
}

/// Run the daemon until SIGINT/SIGTERM or a `terminate` request.
pub fn run_daemon(config: &Config) -> Result<()> {
    let options = DaemonOptions::from_config(config);
    let sock = options.paths.sock.clone();
    let listen_addr = options.listen_addr.clone();
    options.paths.ensure_roots()?;

    if UnixStream::connect(&sock).is_ok() {
        tracing::warn!(sock = %sock.display(), "daemon already running");
        return Ok(());
    }
    let _ = std::fs::remove_file(&sock);

    let root = CancelToken::new();
    let daemon = Daemon::start(options, &root)?;
    let pid_path = daemon.paths().pid_path();
    write_replace(&pid_path, format!("{}\n", std::process::id()).as_bytes())?;

    let listener = UnixListener::bind(&sock)?;
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&sock, std::fs::Permissions::from_mode(0o600));
    }
    listener.set_nonblocking(true)?;
    tracing::info!(sock = %sock.display(), "listening for clients");

    let signalled = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, signalled.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, signalled.clone());

    let peers = match listen_addr {
        Some(addr) => Some(spawn_peer_listener(&daemon, &addr)?),
        None => None,
    };

    let outcome = accept_clients(&daemon, &listener, &signalled);
    let reason = match &outcome {
        Ok(()) if signalled.load(Ordering::Relaxed) => CancelReason::shutdown("signal received"),
        Ok(()) => daemon
            .stop_token()
            .reason()
            .unwrap_or_else(|| CancelReason::shutdown("stopped")),
        Err(err) => CancelReason::shutdown(format!("accept failed: {err}")),
    };
    tracing::info!(reason = %reason, "daemon stopping");
    daemon.shutdown(reason);
    if let Some(handle) = peers {
        let _ = handle.join();
    }

    let _ = std::fs::remove_file(&sock);
    let _ = std::fs::remove_file(&pid_path);
    outcome
}

fn accept_clients(daemon: &Arc<Daemon>, listener: &UnixListener, signalled: &AtomicBool) -> Result<()> {
    loop {
        if signalled.load(Ordering::Relaxed) || daemon.stop_token().is_cancelled() {
            return Ok(());
        }
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                if let Err(err) = daemon.serve_client(stream) {
                    tracing::warn!(error = %err, "client session setup failed");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn spawn_peer_listener(daemon: &Arc<Daemon>, addr: &str) -> Result<thread::JoinHandle<()>> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    tracing::info!(addr = %listener.local_addr()?, "listening for peers");
    let daemon = Arc::clone(daemon);
    let handle = thread::Builder::new()
        .name("peer-accept".into())
        .spawn(move || {
            while !daemon.stop_token().is_cancelled() {
                match listener.accept() {
                    Ok((stream, remote)) => {
                        let daemon = Arc::clone(&daemon);
                        let _ = thread::Builder::new().name("peer-hello".into()).spawn(move || {
                            if let Err(err) = stream
                                .set_nonblocking(false)
                                .map_err(crate::Error::from)
                                .and_then(|()| daemon.serve_peer(stream))
                            {
                                tracing::warn!(connection = %remote, error = %err, "peer rejected");
                            }
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        tracing::error!(error = %e, "peer listener failed");
                        daemon.request_stop(CancelReason::shutdown(format!("peer accept failed: {e}")));
                        return;
                    }
                }
            }
        })?;
    Ok(handle)
}
