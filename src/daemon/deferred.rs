//! Deferred cells and the memo table built on them.
//!
//! A [`Deferred`] settles once; every waiter observes the same outcome.
//! [`Memo`] maps keys to deferred constructions so that at most one
//! construction per key is ever in flight.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use super::sync::{lock, wait, wait_timeout};

/// Construction ended without settling its cell (the constructor panicked).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Abandoned;

struct Slot<T, E> {
    outcome: Option<Result<T, E>>,
    watchers: Vec<Sender<Result<T, E>>>,
}

struct Shared<T, E> {
    slot: Mutex<Slot<T, E>>,
    cond: Condvar,
}

pub struct Deferred<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone, E: Clone> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    outcome: None,
                    watchers: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// First outcome wins; returns `false` if already settled.
    pub fn settle(&self, outcome: Result<T, E>) -> bool {
        let watchers = {
            let mut slot = lock(&self.shared.slot);
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            self.shared.cond.notify_all();
            std::mem::take(&mut slot.watchers)
        };
        for watcher in watchers {
            let _ = watcher.send(outcome.clone());
        }
        true
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, err: E) -> bool {
        self.settle(Err(err))
    }

    pub fn peek(&self) -> Option<Result<T, E>> {
        lock(&self.shared.slot).outcome.clone()
    }

    pub fn is_settled(&self) -> bool {
        lock(&self.shared.slot).outcome.is_some()
    }

    pub fn wait(&self) -> Result<T, E> {
        let mut slot = lock(&self.shared.slot);
        loop {
            if let Some(outcome) = slot.outcome.clone() {
                return outcome;
            }
            slot = wait(&self.shared.cond, slot);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.shared.slot);
        loop {
            if let Some(outcome) = slot.outcome.clone() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = wait_timeout(&self.shared.cond, slot, deadline - now);
        }
    }

    /// Receiver that yields the outcome once settled.
    pub fn watch(&self) -> Receiver<Result<T, E>> {
        let (tx, rx) = channel::bounded(1);
        let mut slot = lock(&self.shared.slot);
        match slot.outcome.clone() {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => slot.watchers.push(tx),
        }
        rx
    }

    pub fn same(&self, other: &Deferred<T, E>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Settles its cell with [`Abandoned`] if dropped unsettled.
struct SettleGuard<T: Clone, E: Clone + From<Abandoned>> {
    cell: Deferred<T, E>,
}

impl<T: Clone, E: Clone + From<Abandoned>> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        self.cell.settle(Err(E::from(Abandoned)));
    }
}

pub struct Memo<K, T, E> {
    cells: Mutex<HashMap<K, Deferred<T, E>>>,
}

impl<K, T, E> Default for Memo<K, T, E> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T, E> Memo<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone,
    E: Clone + From<Abandoned>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the cell for `key`, or insert one and run `construct` to settle
    /// it. The placeholder is in the table before `construct` starts.
    /// Failed constructions stay memoized until evicted.
    pub fn get_or_construct(
        &self,
        key: &K,
        construct: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let cell = {
            let mut cells = lock(&self.cells);
            if let Some(existing) = cells.get(key) {
                let existing = existing.clone();
                drop(cells);
                return existing.wait();
            }
            let cell = Deferred::new();
            cells.insert(key.clone(), cell.clone());
            cell
        };
        let guard = SettleGuard { cell };
        let outcome = construct();
        guard.cell.settle(outcome.clone());
        outcome
    }

    /// Record an already-built value without constructing.
    pub fn insert_resolved(&self, key: K, value: T) {
        let cell = Deferred::new();
        cell.resolve(value);
        lock(&self.cells).insert(key, cell);
    }

    pub fn get(&self, key: &K) -> Option<Deferred<T, E>> {
        lock(&self.cells).get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.cells).contains_key(key)
    }

    pub fn evict(&self, key: &K) -> Option<Deferred<T, E>> {
        lock(&self.cells).remove(key)
    }

    /// Evict only if the entry is still `cell`, so a newer construction for
    /// the same key is left alone.
    pub fn evict_if_same(&self, key: &K, cell: &Deferred<T, E>) -> bool {
        let mut cells = lock(&self.cells);
        match cells.get(key) {
            Some(current) if current.same(cell) => {
                cells.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.cells).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.cells).is_empty()
    }
}
