//! Cancellation tokens.
//!
//! A token is cancelled at most once and stays cancelled. Children are
//! cancelled with their parent; cancelling a child never touches the parent.
//! Callbacks and watchers run on the cancelling thread, outside the lock.
//! Links to other tokens (children, bound fates) hold them weakly and are
//! pruned once the target is dropped or cancelled.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use super::sync::{lock, wait, wait_timeout};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelKind {
    /// Explicit request (terminate, client close).
    Requested,
    /// Propagated from a parent token.
    Parent,
    /// A deadline elapsed.
    Timeout,
    /// Daemon shutdown.
    Shutdown,
    /// Remote control refused this connection.
    Refused,
    /// The underlying connection closed.
    Closed,
}

impl CancelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelKind::Requested => "requested",
            CancelKind::Parent => "parent",
            CancelKind::Timeout => "timeout",
            CancelKind::Shutdown => "shutdown",
            CancelKind::Refused => "refused",
            CancelKind::Closed => "closed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelReason {
    pub kind: CancelKind,
    pub message: String,
}

impl CancelReason {
    pub fn new(kind: CancelKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn requested(message: impl Into<String>) -> Self {
        Self::new(CancelKind::Requested, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CancelKind::Timeout, message)
    }

    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::new(CancelKind::Shutdown, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(CancelKind::Refused, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(CancelKind::Closed, message)
    }

    fn inherited(parent: &CancelReason) -> Self {
        Self::new(CancelKind::Parent, parent.to_string())
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

type Callback = Box<dyn FnOnce(&CancelReason) + Send>;

/// Handle for removing a callback registered with [`CancelToken::on_cancel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkKind {
    /// Target is a child: it sees a `Parent` reason.
    Inherit,
    /// Target shares this token's fate and reason.
    Share,
}

impl LinkKind {
    fn reason_for(self, reason: &CancelReason) -> CancelReason {
        match self {
            LinkKind::Inherit => CancelReason::inherited(reason),
            LinkKind::Share => reason.clone(),
        }
    }
}

struct Link {
    target: Weak<Inner>,
    kind: LinkKind,
}

impl Link {
    fn is_live(&self) -> bool {
        self.target
            .upgrade()
            .is_some_and(|inner| !inner.cancelled.load(Ordering::Acquire))
    }
}

#[derive(Default)]
struct TokenState {
    reason: Option<CancelReason>,
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
    watchers: Vec<Sender<CancelReason>>,
    links: Vec<Link>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<TokenState>,
    cond: Condvar,
    // Mirrors `state.reason.is_some()`; read without the lock when pruning.
    cancelled: AtomicBool,
}

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// New token cancelled whenever `self` is.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        self.link(&child, LinkKind::Inherit);
        child
    }

    fn link(&self, target: &CancelToken, kind: LinkKind) {
        let mut state = lock(&self.inner.state);
        match state.reason.clone() {
            Some(reason) => {
                drop(state);
                target.cancel(kind.reason_for(&reason));
            }
            None => {
                state.links.retain(Link::is_live);
                state.links.push(Link {
                    target: target.downgrade(),
                    kind,
                });
            }
        }
    }

    /// Returns `false` if the token was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let (callbacks, watchers, links) = {
            let mut state = lock(&self.inner.state);
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            self.inner.cancelled.store(true, Ordering::Release);
            self.inner.cond.notify_all();
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.watchers),
                std::mem::take(&mut state.links),
            )
        };
        for watcher in watchers {
            let _ = watcher.send(reason.clone());
        }
        for (_, callback) in callbacks {
            callback(&reason);
        }
        for link in links {
            if let Some(target) = upgrade(&link.target) {
                target.cancel(link.kind.reason_for(&reason));
            }
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner.state).reason.is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        lock(&self.inner.state).reason.clone()
    }

    /// Run `callback` once, on cancellation. Runs immediately if the token is
    /// already cancelled.
    pub fn on_cancel(&self, callback: impl FnOnce(&CancelReason) + Send + 'static) -> CallbackId {
        let mut state = lock(&self.inner.state);
        let id = state.next_id;
        state.next_id += 1;
        match state.reason.clone() {
            Some(reason) => {
                drop(state);
                callback(&reason);
            }
            None => state.callbacks.push((id, Box::new(callback))),
        }
        CallbackId(id)
    }

    pub fn remove_callback(&self, id: CallbackId) {
        lock(&self.inner.state)
            .callbacks
            .retain(|(candidate, _)| *candidate != id.0);
    }

    /// Receiver that yields the reason once cancelled; usable in `select!`.
    pub fn cancelled(&self) -> Receiver<CancelReason> {
        let (tx, rx) = channel::bounded(1);
        let mut state = lock(&self.inner.state);
        match state.reason.clone() {
            Some(reason) => {
                let _ = tx.send(reason);
            }
            None => state.watchers.push(tx),
        }
        rx
    }

    pub fn wait(&self) -> CancelReason {
        let mut state = lock(&self.inner.state);
        loop {
            if let Some(reason) = state.reason.clone() {
                return reason;
            }
            state = wait(&self.inner.cond, state);
        }
    }

    /// `None` if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CancelReason> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        loop {
            if let Some(reason) = state.reason.clone() {
                return Some(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = wait_timeout(&self.inner.cond, state, deadline - now);
        }
    }

    pub fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    #[cfg(test)]
    fn link_count(&self) -> usize {
        lock(&self.inner.state).links.len()
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<CancelToken> {
    weak.upgrade().map(|inner| CancelToken { inner })
}

/// Cancel each token when the other is cancelled. Neither keeps the other
/// alive.
pub fn bind_fates(a: &CancelToken, b: &CancelToken) {
    if a.same(b) {
        return;
    }
    a.link(b, LinkKind::Share);
    b.link(a, LinkKind::Share);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn cancel_is_permanent_and_first_reason_wins() {
        let token = CancelToken::new();
        assert!(token.cancel(CancelReason::requested("first")));
        assert!(!token.cancel(CancelReason::timeout("second")));
        assert_eq!(token.reason().unwrap().message, "first");
    }

    #[test]
    fn children_follow_parent_but_not_the_reverse() {
        let parent = CancelToken::new();
        let a = parent.child();
        let b = parent.child();

        a.cancel(CancelReason::requested("a only"));
        assert!(!parent.is_cancelled());
        assert!(!b.is_cancelled());

        parent.cancel(CancelReason::shutdown("bye"));
        assert_eq!(b.reason().unwrap().kind, CancelKind::Parent);
        assert_eq!(a.reason().unwrap().message, "a only");
    }

    #[test]
    fn cancelled_child_unregisters_from_parent() {
        let parent = CancelToken::new();
        for _ in 0..8 {
            parent.child().cancel(CancelReason::requested("done"));
        }
        assert!(lock(&parent.inner.state).callbacks.is_empty());
        assert!(parent.link_count() <= 1);
    }

    #[test]
    fn late_callbacks_and_watchers_fire_immediately() {
        let token = CancelToken::new();
        token.cancel(CancelReason::closed("gone"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(token.cancelled().try_recv().unwrap().kind, CancelKind::Closed);
    }

    #[test]
    fn wait_wakes_on_cancel_from_another_thread() {
        let token = CancelToken::new();
        assert!(token.wait_timeout(Duration::from_millis(10)).is_none());
        let remote = token.clone();
        let handle = thread::spawn(move || remote.wait());
        token.cancel(CancelReason::requested("wake"));
        assert_eq!(handle.join().unwrap().message, "wake");
    }

    #[test]
    fn bound_fates_cancel_together() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        bind_fates(&a, &b);
        b.cancel(CancelReason::closed("b dropped"));
        assert_eq!(a.reason().unwrap().message, "b dropped");
    }

    #[test]
    fn long_lived_tokens_do_not_accumulate_links() {
        let connection = CancelToken::new();
        for _ in 0..100 {
            let session = CancelToken::new();
            bind_fates(&connection, &session);
        }
        assert!(connection.link_count() <= 1);

        for _ in 0..100 {
            let session = connection.child();
            session.cancel(CancelReason::closed("session over"));
        }
        assert!(connection.link_count() <= 1);

        let live = CancelToken::new();
        bind_fates(&connection, &live);
        connection.cancel(CancelReason::shutdown("done"));
        assert_eq!(live.reason().unwrap().message, "done");
    }
}
