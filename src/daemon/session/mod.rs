//! Capability-transport sessions.
//!
//! A session is a duplex framed stream carrying `call`/`return` envelopes in
//! both directions. Incoming calls are dispatched to the local [`Bootstrap`]
//! on their own thread; outgoing calls wait for the matching `return`.
//! When the session closes every pending call fails with
//! [`SessionError::Closed`].

pub mod frame;
pub mod proto;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::cancel::{CancelReason, CancelToken};
use super::sync::{lock, wait_timeout};
use crate::error::{Effect, Transience};

pub use frame::{FRAME_HEADER_LEN, FrameError, MessageReader, MessageWriter, encode};
pub use proto::{Envelope, ErrorPayload, Hello};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session closed: {reason}")]
    Closed { reason: String },
    #[error("session protocol error: {reason}")]
    Protocol { reason: String },
    #[error("remote error {0}")]
    Remote(ErrorPayload),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Closed { .. } => "session_closed",
            SessionError::Protocol { .. } => "protocol",
            SessionError::Remote(_) => "remote",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            SessionError::Closed { .. } => Transience::Retryable,
            SessionError::Protocol { .. } => Transience::Permanent,
            SessionError::Remote(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            SessionError::Closed { .. } | SessionError::Remote(_) => Effect::Unknown,
            SessionError::Protocol { .. } => Effect::None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            SessionError::Remote(payload) => payload.clone(),
            other => ErrorPayload::new(other.code(), other.to_string()),
        }
    }
}

/// Local object answering the peer's calls.
pub trait Bootstrap: Send + Sync + 'static {
    fn dispatch(&self, request: Value) -> Result<Value, ErrorPayload>;
}

/// Refuses every incoming call. For sessions that only make calls.
pub struct NoBootstrap;

impl Bootstrap for NoBootstrap {
    fn dispatch(&self, _request: Value) -> Result<Value, ErrorPayload> {
        Err(ErrorPayload::new("unsupported", "no bootstrap on this side"))
    }
}

type ShutdownFn = Box<dyn Fn() + Send + Sync>;

/// Byte stream a session runs over.
pub struct Transport {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    shutdown: ShutdownFn,
}

impl Transport {
    pub fn unix(stream: UnixStream) -> std::io::Result<Self> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(stream),
            shutdown: Box::new(move || {
                let _ = control.shutdown(Shutdown::Both);
            }),
        })
    }

    pub fn tcp(stream: TcpStream) -> std::io::Result<Self> {
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(stream),
            shutdown: Box::new(move || {
                let _ = control.shutdown(Shutdown::Both);
            }),
        })
    }

    /// Pipes and other streams. `shutdown` must unblock the reader, or the
    /// reader thread lingers until the other side closes.
    pub fn from_parts(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        shutdown: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            shutdown: Box::new(shutdown),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Shows up in thread names and log lines.
    pub name: String,
    pub max_frame_bytes: usize,
}

impl SessionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

type Reply = Result<Value, SessionError>;

#[derive(Default)]
struct Pending {
    next_question: u64,
    waiting: HashMap<u64, Sender<Reply>>,
    closed: Option<String>,
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

struct Inner {
    name: String,
    writer: Mutex<MessageWriter<Box<dyn Write + Send>>>,
    pending: Mutex<Pending>,
    in_flight: InFlight,
    closed: CancelToken,
    shutdown: ShutdownFn,
    bootstrap: Arc<dyn Bootstrap>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl Session {
    /// Start a session. It closes when `parent` is cancelled, when the
    /// transport ends, or on [`Session::close`].
    pub fn open(
        transport: Transport,
        bootstrap: Arc<dyn Bootstrap>,
        parent: &CancelToken,
        options: SessionOptions,
    ) -> Session {
        let Transport {
            reader,
            writer,
            shutdown,
        } = transport;
        let inner = Arc::new(Inner {
            name: options.name.clone(),
            writer: Mutex::new(MessageWriter::new(writer, options.max_frame_bytes)),
            pending: Mutex::new(Pending::default()),
            in_flight: InFlight::default(),
            closed: parent.child(),
            shutdown,
            bootstrap,
        });

        let weak = Arc::downgrade(&inner);
        inner.closed.on_cancel(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.fail_pending(reason);
                (inner.shutdown)();
            }
        });

        let weak = Arc::downgrade(&inner);
        let reader = MessageReader::new(reader, options.max_frame_bytes);
        let spawned = thread::Builder::new()
            .name(format!("session-{}", options.name))
            .spawn(move || read_loop(weak, reader));
        if let Err(err) = spawned {
            inner
                .closed
                .cancel(CancelReason::closed(format!("reader thread failed: {err}")));
        }

        Session { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send a call and block for its answer.
    pub fn call(&self, request: Value) -> Result<Value, SessionError> {
        let rx = self.send_call(request)?;
        rx.recv().unwrap_or_else(|_| {
            Err(SessionError::Closed {
                reason: "reply channel dropped".into(),
            })
        })
    }

    pub fn call_as<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        request: &Req,
    ) -> Result<Resp, SessionError> {
        let request = serde_json::to_value(request).map_err(|e| SessionError::Protocol {
            reason: format!("encode request: {e}"),
        })?;
        let value = self.call(request)?;
        serde_json::from_value(value).map_err(|e| SessionError::Protocol {
            reason: format!("decode reply: {e}"),
        })
    }

    /// Send a call; the receiver yields exactly one answer.
    pub fn send_call(&self, request: Value) -> Result<Receiver<Reply>, SessionError> {
        let (tx, rx) = channel::bounded(1);
        let question = {
            let mut pending = lock(&self.inner.pending);
            if let Some(reason) = &pending.closed {
                return Err(SessionError::Closed {
                    reason: reason.clone(),
                });
            }
            let question = pending.next_question;
            pending.next_question += 1;
            pending.waiting.insert(question, tx);
            question
        };
        let envelope = Envelope::Call { question, request };
        if let Err(err) = self.inner.send(&envelope) {
            lock(&self.inner.pending).waiting.remove(&question);
            return Err(err);
        }
        Ok(rx)
    }

    pub fn close(&self, reason: CancelReason) {
        self.inner.closed.cancel(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token cancelled when the session closes.
    pub fn closed(&self) -> &CancelToken {
        &self.inner.closed
    }

    /// Wait until no incoming call is being answered. `false` on timeout.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock(&self.inner.in_flight.count);
        loop {
            if *count == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = wait_timeout(&self.inner.in_flight.idle, count, deadline - now);
        }
    }
}

impl Inner {
    fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let written = lock(&self.writer).send(envelope);
        match written {
            Ok(_) => Ok(()),
            Err(FrameError::TooLarge {
                max_frame_bytes,
                got_bytes,
            }) => Err(SessionError::Protocol {
                reason: format!("message of {got_bytes} bytes exceeds {max_frame_bytes}"),
            }),
            Err(FrameError::Encode(reason)) => Err(SessionError::Protocol {
                reason: format!("encode envelope: {reason}"),
            }),
            Err(err) => {
                let reason = format!("write failed: {err}");
                self.closed.cancel(CancelReason::closed(reason.clone()));
                Err(SessionError::Closed { reason })
            }
        }
    }

    fn fail_pending(&self, reason: &CancelReason) {
        let waiting = {
            let mut pending = lock(&self.pending);
            pending.closed = Some(reason.to_string());
            std::mem::take(&mut pending.waiting)
        };
        for (_, tx) in waiting {
            let _ = tx.send(Err(SessionError::Closed {
                reason: reason.to_string(),
            }));
        }
    }

    fn answer(&self, question: u64, outcome: Reply) {
        let tx = lock(&self.pending).waiting.remove(&question);
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::debug!(session = %self.name, question, "answer for unknown question");
            }
        }
    }

    fn begin_reply(&self) {
        *lock(&self.in_flight.count) += 1;
    }

    fn end_reply(&self) {
        let mut count = lock(&self.in_flight.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.in_flight.idle.notify_all();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closed
            .cancel(CancelReason::closed("last session handle dropped"));
        (self.shutdown)();
    }
}

fn read_loop(weak: Weak<Inner>, mut reader: MessageReader<Box<dyn Read + Send>>) {
    loop {
        let next = reader.recv::<Envelope>();
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                inner
                    .closed
                    .cancel(CancelReason::closed("peer closed the connection"));
                return;
            }
            Err(FrameError::Decode(err)) => {
                tracing::warn!(session = %inner.name, error = %err, "malformed envelope");
                inner
                    .closed
                    .cancel(CancelReason::closed(format!("malformed envelope: {err}")));
                return;
            }
            Err(err) => {
                if !inner.closed.is_cancelled() {
                    tracing::debug!(session = %inner.name, error = %err, "session read failed");
                }
                inner
                    .closed
                    .cancel(CancelReason::closed(format!("read failed: {err}")));
                return;
            }
        };

        match envelope {
            Envelope::Call { question, request } => spawn_dispatch(&inner, question, request),
            Envelope::Return { question, ok, err } => {
                let outcome = match err {
                    Some(payload) => Err(SessionError::Remote(payload)),
                    None => Ok(ok.unwrap_or(Value::Null)),
                };
                inner.answer(question, outcome);
            }
        }
    }
}

fn spawn_dispatch(inner: &Arc<Inner>, question: u64, request: Value) {
    inner.begin_reply();
    let worker = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name(format!("call-{}-{question}", inner.name))
        .spawn(move || {
            let outcome = worker.bootstrap.dispatch(request);
            if !worker.closed.is_cancelled()
                && let Err(err) = worker.send(&Envelope::answer(question, outcome))
            {
                tracing::debug!(session = %worker.name, question, error = %err, "reply not sent");
            }
            worker.end_reply();
        });
    if let Err(err) = spawned {
        inner.end_reply();
        tracing::warn!(session = %inner.name, error = %err, "failed to spawn call thread");
        let _ = inner.send(&Envelope::answer(
            question,
            Err(ErrorPayload::new("io", format!("cannot dispatch: {err}"))),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    struct Echo;

    impl Bootstrap for Echo {
        fn dispatch(&self, request: Value) -> Result<Value, ErrorPayload> {
            match request.get("fail") {
                Some(_) => Err(ErrorPayload::new("unknown_reference", "no such thing")),
                None => Ok(json!({ "echo": request })),
            }
        }
    }

    struct Hang;

    impl Bootstrap for Hang {
        fn dispatch(&self, _request: Value) -> Result<Value, ErrorPayload> {
            thread::sleep(Duration::from_secs(30));
            Ok(Value::Null)
        }
    }

    fn pair(
        left: Arc<dyn Bootstrap>,
        right: Arc<dyn Bootstrap>,
        parent: &CancelToken,
    ) -> (Session, Session) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Session::open(
                Transport::unix(a).unwrap(),
                left,
                parent,
                SessionOptions::named("left"),
            ),
            Session::open(
                Transport::unix(b).unwrap(),
                right,
                parent,
                SessionOptions::named("right"),
            ),
        )
    }

    #[test]
    fn calls_flow_both_ways() {
        let root = CancelToken::new();
        let (left, right) = pair(Arc::new(Echo), Arc::new(Echo), &root);
        assert_eq!(
            left.call(json!({"n": 1})).unwrap(),
            json!({"echo": {"n": 1}})
        );
        assert_eq!(
            right.call(json!("hi")).unwrap(),
            json!({"echo": "hi"})
        );
    }

    #[test]
    fn remote_errors_come_back_typed() {
        let root = CancelToken::new();
        let (left, _right) = pair(Arc::new(NoBootstrap), Arc::new(Echo), &root);
        let err = left.call(json!({"fail": true})).unwrap_err();
        match err {
            SessionError::Remote(payload) => assert_eq!(payload.code, "unknown_reference"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn closing_fails_pending_calls() {
        let root = CancelToken::new();
        let (left, right) = pair(Arc::new(NoBootstrap), Arc::new(Hang), &root);
        let rx = left.send_call(json!({})).unwrap();
        thread::sleep(Duration::from_millis(20));
        right.close(CancelReason::requested("test"));
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Err(SessionError::Closed { .. })));
        left.closed().wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            left.call(json!({})),
            Err(SessionError::Closed { .. })
        ));
    }

    #[test]
    fn parent_cancel_closes_session() {
        let root = CancelToken::new();
        let (left, right) = pair(Arc::new(Echo), Arc::new(Echo), &root);
        root.cancel(CancelReason::shutdown("daemon stopping"));
        assert!(left.is_closed());
        assert!(right.is_closed());
    }

    #[test]
    fn drain_waits_for_replies() {
        let root = CancelToken::new();
        let (left, right) = pair(Arc::new(NoBootstrap), Arc::new(Echo), &root);
        left.call(json!(1)).unwrap();
        assert!(right.drain(Duration::from_secs(1)));
    }
}
