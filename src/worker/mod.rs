//! Worker-side runtime.
//!
//! A worker answers [`WorkerRequest`]s on one session. Under `endo-worker`
//! the session runs over stdin/stdout; [`InProcessLauncher`] runs the same
//! loop on a thread over a socket pair.

pub mod evaluator;
pub mod protocol;

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::select;
use serde_json::{Value, json};

use crate::daemon::cancel::{CancelReason, CancelToken};
use crate::daemon::session::{Bootstrap, ErrorPayload, Session, SessionOptions, Transport};
use crate::daemon::worker::{LaunchedWorker, WorkerError, WorkerLauncher, WorkerSpec};

pub use evaluator::{EvalError, evaluate};
pub use protocol::WorkerRequest;

/// How long a terminating worker waits for its reply to go out.
const REPLY_DRAIN: Duration = Duration::from_secs(1);

struct WorkerFacet {
    terminate: CancelToken,
}

impl Bootstrap for WorkerFacet {
    fn dispatch(&self, request: Value) -> Result<Value, ErrorPayload> {
        let request: WorkerRequest = serde_json::from_value(request)
            .map_err(|e| ErrorPayload::new("protocol", format!("bad worker request: {e}")))?;
        match request {
            WorkerRequest::Evaluate {
                source,
                names,
                values,
            } => {
                tracing::debug!(source = %source, "evaluate");
                Ok(evaluate(&source, &names, &values)?)
            }
            WorkerRequest::ImportBundle { source, powers } => {
                tracing::debug!("import bundle");
                Ok(evaluate(&source, &["powers".to_string()], &[powers])?)
            }
            WorkerRequest::Terminate => {
                self.terminate
                    .cancel(CancelReason::requested("terminate requested"));
                Ok(Value::Null)
            }
            WorkerRequest::Ping => Ok(json!("pong")),
        }
    }
}

/// Serve worker requests until asked to terminate, the session ends, or
/// `parent` is cancelled. Returns why the worker stopped.
pub fn run_worker(transport: Transport, parent: &CancelToken, options: SessionOptions) -> CancelReason {
    let terminate = parent.child();
    let facet = Arc::new(WorkerFacet {
        terminate: terminate.clone(),
    });
    let session = Session::open(transport, facet, parent, options);
    let closed = session.closed().cancelled();
    let terminated = terminate.cancelled();

    let reason = select! {
        recv(terminated) -> reason => reason.unwrap_or_else(|_| CancelReason::requested("terminate")),
        recv(closed) -> reason => reason.unwrap_or_else(|_| CancelReason::closed("session dropped")),
    };
    // The terminate reply is sent by the call thread; let it finish.
    if !session.drain(REPLY_DRAIN) {
        tracing::warn!("worker exiting with calls still in flight");
    }
    session.close(reason.clone());
    tracing::info!(reason = %reason, "worker stopping");
    reason
}

/// Runs each worker on a thread of the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessLauncher;

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, spec: &WorkerSpec, cancel: &CancelToken) -> Result<LaunchedWorker, WorkerError> {
        let (daemon_end, worker_end) =
            UnixStream::pair().map_err(|e| WorkerError::io(&spec.sock, e))?;
        let worker_transport =
            Transport::unix(worker_end).map_err(|e| WorkerError::io(&spec.sock, e))?;
        let daemon_transport =
            Transport::unix(daemon_end).map_err(|e| WorkerError::io(&spec.sock, e))?;

        let worker_token = CancelToken::new();
        {
            let worker_token = worker_token.clone();
            cancel.on_cancel(move |reason| {
                worker_token.cancel(CancelReason::new(reason.kind, "killed"));
            });
        }

        let exited = CancelToken::new();
        let signal = exited.clone();
        let name = format!("worker-{}", spec.id.number().short());
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let reason = run_worker(worker_transport, &worker_token, SessionOptions::named(name));
                signal.cancel(CancelReason::closed(format!("worker exited: {reason}")));
            })
            .map_err(|e| WorkerError::io(&spec.state_dir, e))?;

        Ok(LaunchedWorker {
            transport: daemon_transport,
            exited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::daemon::session::NoBootstrap;

    fn pair() -> (Session, CancelToken, thread::JoinHandle<CancelReason>) {
        let (a, b) = UnixStream::pair().unwrap();
        let worker_token = CancelToken::new();
        let token = worker_token.clone();
        let handle = thread::spawn(move || {
            run_worker(
                Transport::unix(b).unwrap(),
                &token,
                SessionOptions::named("worker"),
            )
        });
        let daemon = Session::open(
            Transport::unix(a).unwrap(),
            Arc::new(NoBootstrap),
            &CancelToken::new(),
            SessionOptions::named("daemon"),
        );
        (daemon, worker_token, handle)
    }

    #[test]
    fn terminate_is_answered_before_exit() {
        let (daemon, _token, handle) = pair();
        let reply = daemon
            .call(serde_json::to_value(WorkerRequest::Terminate).unwrap())
            .unwrap();
        assert_eq!(reply, Value::Null);
        let reason = handle.join().unwrap();
        assert_eq!(reason.message, "terminate requested");
    }

    #[test]
    fn bundle_sees_powers() {
        let (daemon, token, handle) = pair();
        let request = WorkerRequest::ImportBundle {
            source: "powers.greeting".into(),
            powers: json!({"greeting": "hello"}),
        };
        assert_eq!(daemon.call_as::<_, Value>(&request).unwrap(), json!("hello"));
        token.cancel(CancelReason::shutdown("done"));
        handle.join().unwrap();
    }

    #[test]
    fn malformed_requests_are_protocol_errors() {
        let (daemon, _token, _handle) = pair();
        let err = daemon.call(json!({"op": "dance"})).unwrap_err();
        assert_eq!(err.to_payload().code, "protocol");
    }
}
