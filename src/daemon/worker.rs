//! Worker process lifecycle.
//!
//! One isolated process per worker formula. The daemon talks to it over a
//! session on the child's stdin/stdout. Each worker has a cancellation token
//! derived from the daemon's; cancelling it kills the process, and the
//! process exiting (or its session closing) cancels it in turn. A worker
//! never cancels its parent.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::Receiver;
use serde_json::Value;
use thiserror::Error;

use crate::core::FormulaId;
use crate::error::{Effect, Transience};
use crate::paths::DaemonPaths;
use crate::worker::WorkerRequest;

use super::cancel::{CancelReason, CancelToken};
use super::race::Race;
use super::session::{ErrorPayload, NoBootstrap, Session, SessionError, SessionOptions, Transport};

const EXIT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum WorkerError {
    #[error("failed to spawn worker program {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("worker {worker} did not terminate within {grace_ms}ms")]
    TerminationTimeout { worker: String, grace_ms: u64 },
    #[error(transparent)]
    Session(SessionError),
    #[error("worker error {0}")]
    Remote(ErrorPayload),
}

impl WorkerError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WorkerError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            WorkerError::Spawn { .. } => "spawn_failed",
            WorkerError::Io { .. } => "io",
            WorkerError::TerminationTimeout { .. } => "termination_timeout",
            WorkerError::Session(e) => e.code(),
            WorkerError::Remote(_) => "remote",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            WorkerError::Spawn { .. } | WorkerError::Io { .. } => Transience::Unknown,
            WorkerError::TerminationTimeout { .. } => Transience::Retryable,
            WorkerError::Session(e) => e.transience(),
            WorkerError::Remote(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            WorkerError::Spawn { .. } => Effect::None,
            WorkerError::TerminationTimeout { .. } => Effect::Some,
            WorkerError::Io { .. } | WorkerError::Remote(_) => Effect::Unknown,
            WorkerError::Session(e) => e.effect(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            WorkerError::Remote(payload) => payload.clone(),
            WorkerError::Session(e) => e.to_payload(),
            other => ErrorPayload::new(other.code(), other.to_string()),
        }
    }
}

impl From<SessionError> for WorkerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Remote(payload) => WorkerError::Remote(payload),
            other => WorkerError::Session(other),
        }
    }
}

/// Everything a launcher needs to start one worker.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub id: FormulaId,
    pub state_dir: PathBuf,
    pub ephemeral_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
    pub sock: PathBuf,
}

impl WorkerSpec {
    pub fn new(id: &FormulaId, paths: &DaemonPaths) -> Self {
        let number = id.number();
        Self {
            id: id.clone(),
            state_dir: paths.worker_state_dir(number),
            ephemeral_dir: paths.worker_ephemeral_dir(number),
            cache_dir: paths.worker_cache_dir(number),
            log_path: paths.worker_log_path(number),
            pid_path: paths.worker_pid_path(number),
            sock: paths.sock.clone(),
        }
    }

    fn create_dirs(&self) -> Result<(), WorkerError> {
        for dir in [&self.state_dir, &self.ephemeral_dir, &self.cache_dir] {
            fs::create_dir_all(dir).map_err(|e| WorkerError::io(dir, e))?;
        }
        Ok(())
    }
}

/// A started worker: the session transport and a token that fires once the
/// worker is gone.
pub struct LaunchedWorker {
    pub transport: Transport,
    pub exited: CancelToken,
}

/// Starts worker runtimes. Implementations must stop the worker when
/// `cancel` fires and then fire `exited`.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, spec: &WorkerSpec, cancel: &CancelToken) -> Result<LaunchedWorker, WorkerError>;
}

/// Runs `<program> <id> <state> <ephemeral> <cache> <sock>` as a child
/// process.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `endo-worker` next to the running executable, or on `PATH`.
    pub fn sibling_of_current_exe() -> Self {
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("endo-worker")))
            .filter(|candidate| candidate.exists());
        Self::new(sibling.unwrap_or_else(|| PathBuf::from("endo-worker")))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &WorkerSpec, cancel: &CancelToken) -> Result<LaunchedWorker, WorkerError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|e| WorkerError::io(&spec.log_path, e))?;

        let mut child = Command::new(&self.program)
            .arg(spec.id.to_string())
            .arg(&spec.state_dir)
            .arg(&spec.ephemeral_dir)
            .arg(&spec.cache_dir)
            .arg(&spec.sock)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| WorkerError::Spawn {
                program: self.program.clone(),
                source: Arc::new(e),
            })?;

        let pid = child.id();
        if let Err(err) = fs::write(&spec.pid_path, format!("{pid}\n")) {
            tracing::warn!(worker = %spec.id, error = %err, "failed to write worker pid file");
        }

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WorkerError::io(
                &self.program,
                io::Error::other("worker stdio was not captured"),
            ));
        };

        let exited = CancelToken::new();
        let waiter = {
            let exited = exited.clone();
            let cancel = cancel.clone();
            let pid_path = spec.pid_path.clone();
            let worker = spec.id.to_string();
            move || reap(child, &cancel, &exited, &pid_path, &worker)
        };
        thread::Builder::new()
            .name(format!("worker-reaper-{}", spec.id.number().short()))
            .spawn(waiter)
            .map_err(|e| WorkerError::io(&spec.pid_path, e))?;

        tracing::info!(worker = %spec.id, pid, "worker process started");
        // Killing the child closes stdout, which ends the session reader.
        Ok(LaunchedWorker {
            transport: Transport::from_parts(stdout, stdin, || {}),
            exited,
        })
    }
}

fn reap(mut child: Child, cancel: &CancelToken, exited: &CancelToken, pid_path: &Path, worker: &str) {
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.to_string(),
            Ok(None) => {
                if cancel.wait_timeout(EXIT_POLL).is_some() {
                    let _ = child.kill();
                    break match child.wait() {
                        Ok(status) => format!("killed ({status})"),
                        Err(err) => format!("killed (wait failed: {err})"),
                    };
                }
            }
            Err(err) => break format!("wait failed: {err}"),
        }
    };
    let _ = fs::remove_file(pid_path);
    tracing::info!(worker, status = %status, "worker process exited");
    exited.cancel(CancelReason::closed(format!("worker exited: {status}")));
}

/// Knobs the daemon passes to every worker it starts.
#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub grace_period: Duration,
    pub max_frame_bytes: usize,
}

/// Daemon-side handle on a live worker.
pub struct EndoWorker {
    id: FormulaId,
    session: Session,
    cancel: CancelToken,
    exited: CancelToken,
    grace_period: Duration,
}

impl fmt::Debug for EndoWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndoWorker")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("exited", &self.exited.is_cancelled())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Termination {
    Reply,
    Exit,
}

impl EndoWorker {
    /// Create the worker's directories, launch it and open its session.
    pub fn spawn(
        id: FormulaId,
        paths: &DaemonPaths,
        launcher: &dyn WorkerLauncher,
        parent: &CancelToken,
        settings: WorkerSettings,
    ) -> Result<Arc<EndoWorker>, WorkerError> {
        let spec = WorkerSpec::new(&id, paths);
        spec.create_dirs()?;

        let cancel = parent.child();
        let launched = match launcher.launch(&spec, &cancel) {
            Ok(launched) => launched,
            Err(err) => {
                cancel.cancel(CancelReason::closed(format!("launch failed: {err}")));
                return Err(err);
            }
        };

        let session = Session::open(
            launched.transport,
            Arc::new(NoBootstrap),
            &cancel,
            SessionOptions::named(format!("worker-{}", id.number().short()))
                .with_max_frame_bytes(settings.max_frame_bytes),
        );

        {
            let cancel = cancel.clone();
            session.closed().on_cancel(move |reason| {
                cancel.cancel(CancelReason::closed(format!("worker session closed: {reason}")));
            });
        }
        {
            let cancel = cancel.clone();
            launched.exited.on_cancel(move |reason| {
                cancel.cancel(reason.clone());
            });
        }

        Ok(Arc::new(EndoWorker {
            id,
            session,
            cancel,
            exited: launched.exited,
            grace_period: settings.grace_period,
        }))
    }

    pub fn id(&self) -> &FormulaId {
        &self.id
    }

    /// Token cancelled when the worker is torn down for any reason.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_terminated(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Yields once the worker has exited.
    pub fn when_terminated(&self) -> Receiver<CancelReason> {
        self.exited.cancelled()
    }

    /// Ask the worker to stop and wait up to the grace period. Whatever
    /// wins, the worker is cancelled (killed) before this returns.
    pub fn terminate(&self) -> Result<(), WorkerError> {
        let exit = self.exited.cancelled();
        let reply = self
            .session
            .send_call(serde_json::to_value(WorkerRequest::Terminate).unwrap_or(Value::Null))
            .ok();

        let mut race = Race::new()
            .enter(Termination::Exit, exit)
            .deadline(self.grace_period);
        if let Some(reply) = reply {
            race = race.enter(Termination::Reply, reply);
        }
        let outcome = race.run();
        self.cancel
            .cancel(CancelReason::requested("worker terminated"));

        match outcome {
            Ok(finish) => {
                tracing::debug!(worker = %self.id, by = ?finish.label, "worker terminated");
                Ok(())
            }
            Err(elapsed) => {
                let grace_ms = u64::try_from(elapsed.after.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(worker = %self.id, grace_ms, "worker did not terminate in time");
                Err(WorkerError::TerminationTimeout {
                    worker: self.id.to_string(),
                    grace_ms,
                })
            }
        }
    }

    pub fn evaluate(
        &self,
        source: &str,
        names: Vec<String>,
        values: Vec<Value>,
    ) -> Result<Value, WorkerError> {
        self.request(&WorkerRequest::Evaluate {
            source: source.to_string(),
            names,
            values,
        })
    }

    pub fn import_bundle(&self, source: &str, powers: Value) -> Result<Value, WorkerError> {
        self.request(&WorkerRequest::ImportBundle {
            source: source.to_string(),
            powers,
        })
    }

    pub fn ping(&self) -> Result<Value, WorkerError> {
        self.request(&WorkerRequest::Ping)
    }

    fn request(&self, request: &WorkerRequest) -> Result<Value, WorkerError> {
        Ok(self.session.call_as(request)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::core::{FormulaNumber, NodeId};
    use crate::daemon::session::{Bootstrap, MessageReader};
    use crate::worker::InProcessLauncher;

    fn settings(grace_ms: u64) -> WorkerSettings {
        WorkerSettings {
            grace_period: Duration::from_millis(grace_ms),
            max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
        }
    }

    fn worker_id() -> FormulaId {
        FormulaId::new(FormulaNumber::generate(), NodeId::generate())
    }

    /// Answers nothing and never exits on its own.
    struct Stubborn;

    impl Bootstrap for Stubborn {
        fn dispatch(&self, _request: Value) -> Result<Value, ErrorPayload> {
            thread::sleep(Duration::from_secs(30));
            Ok(Value::Null)
        }
    }

    struct StubbornLauncher {
        held: Mutex<Vec<Session>>,
    }

    impl WorkerLauncher for StubbornLauncher {
        fn launch(
            &self,
            spec: &WorkerSpec,
            cancel: &CancelToken,
        ) -> Result<LaunchedWorker, WorkerError> {
            let (daemon_end, worker_end) =
                UnixStream::pair().map_err(|e| WorkerError::io(&spec.sock, e))?;
            let worker_side = Session::open(
                Transport::unix(worker_end).map_err(|e| WorkerError::io(&spec.sock, e))?,
                Arc::new(Stubborn),
                &CancelToken::new(),
                SessionOptions::named("stubborn"),
            );
            let exited = CancelToken::new();
            {
                let exited = exited.clone();
                let worker_side = worker_side.clone();
                cancel.on_cancel(move |_| {
                    worker_side.close(CancelReason::requested("killed"));
                    exited.cancel(CancelReason::closed("killed"));
                });
            }
            self.held.lock().unwrap().push(worker_side);
            Ok(LaunchedWorker {
                transport: Transport::unix(daemon_end)
                    .map_err(|e| WorkerError::io(&spec.sock, e))?,
                exited,
            })
        }
    }

    /// Reads one frame, then drops the connection as if the process died.
    struct CrashingLauncher;

    impl WorkerLauncher for CrashingLauncher {
        fn launch(
            &self,
            spec: &WorkerSpec,
            _cancel: &CancelToken,
        ) -> Result<LaunchedWorker, WorkerError> {
            let (daemon_end, worker_end) =
                UnixStream::pair().map_err(|e| WorkerError::io(&spec.sock, e))?;
            let exited = CancelToken::new();
            let signal = exited.clone();
            thread::spawn(move || {
                let mut reader = MessageReader::new(worker_end, 1 << 20);
                let _ = reader.recv::<Value>();
                drop(reader);
                signal.cancel(CancelReason::closed("crashed"));
            });
            Ok(LaunchedWorker {
                transport: Transport::unix(daemon_end)
                    .map_err(|e| WorkerError::io(&spec.sock, e))?,
                exited,
            })
        }
    }

    #[test]
    fn spawn_creates_worker_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::rooted(dir.path());
        let id = worker_id();
        let worker =
            EndoWorker::spawn(id.clone(), &paths, &InProcessLauncher, &CancelToken::new(), settings(1000))
                .unwrap();
        assert!(paths.worker_state_dir(id.number()).is_dir());
        assert!(paths.worker_ephemeral_dir(id.number()).is_dir());
        assert!(paths.worker_cache_dir(id.number()).is_dir());
        assert_eq!(worker.ping().unwrap(), json!("pong"));
    }

    #[test]
    fn evaluate_and_graceful_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::rooted(dir.path());
        let worker =
            EndoWorker::spawn(worker_id(), &paths, &InProcessLauncher, &CancelToken::new(), settings(5000))
                .unwrap();
        let value = worker
            .evaluate("x.y", vec!["x".into()], vec![json!({"y": 42})])
            .unwrap();
        assert_eq!(value, json!(42));

        worker.terminate().unwrap();
        assert!(worker.cancel_token().is_cancelled());
        worker
            .when_terminated()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn stubborn_worker_times_out_and_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::rooted(dir.path());
        let launcher = StubbornLauncher {
            held: Mutex::new(Vec::new()),
        };
        let daemon = CancelToken::new();
        let worker = EndoWorker::spawn(worker_id(), &paths, &launcher, &daemon, settings(50)).unwrap();

        let err = worker.terminate().unwrap_err();
        assert_eq!(err.code(), "termination_timeout");
        assert!(matches!(err, WorkerError::TerminationTimeout { grace_ms: 50, .. }));
        assert!(worker.cancel_token().is_cancelled());
        assert!(worker.is_terminated());
        assert!(!daemon.is_cancelled());
    }

    #[test]
    fn crash_fails_pending_calls() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::rooted(dir.path());
        let worker =
            EndoWorker::spawn(worker_id(), &paths, &CrashingLauncher, &CancelToken::new(), settings(1000))
                .unwrap();
        let err = worker.evaluate("1", Vec::new(), Vec::new()).unwrap_err();
        assert_eq!(err.code(), "session_closed");
        worker
            .cancel_token()
            .wait_timeout(Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn daemon_cancel_tears_workers_down() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::rooted(dir.path());
        let daemon = CancelToken::new();
        let worker =
            EndoWorker::spawn(worker_id(), &paths, &InProcessLauncher, &daemon, settings(1000)).unwrap();
        daemon.cancel(CancelReason::shutdown("stopping"));
        worker
            .when_terminated()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::rooted(dir.path());
        let launcher = ProcessLauncher::new(dir.path().join("no-such-worker"));
        let err = EndoWorker::spawn(worker_id(), &paths, &launcher, &CancelToken::new(), settings(100))
            .unwrap_err();
        assert_eq!(err.code(), "spawn_failed");
    }

    #[test]
    fn child_process_exit_is_observed_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::rooted(dir.path());
        let id = worker_id();
        // `sh <id>` fails to open a script by that name and exits.
        let launcher = ProcessLauncher::new("/bin/sh");
        let worker =
            EndoWorker::spawn(id.clone(), &paths, &launcher, &CancelToken::new(), settings(100)).unwrap();
        worker
            .when_terminated()
            .recv_timeout(Duration::from_secs(10))
            .unwrap();
        assert!(!paths.worker_pid_path(id.number()).exists());
        let log = fs::read_to_string(paths.worker_log_path(id.number())).unwrap();
        assert!(!log.is_empty());
    }
}
