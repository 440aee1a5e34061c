//! Per-key async mutual exclusion.
//!
//! Operations on the same key (usually a file path) are serialized in FIFO
//! arrival order; operations on different keys never wait on each other.
//! State for a key exists only while someone holds or waits for it.
//!
//! Release is tied to [`KeyedLockGuard`]'s `Drop`, so an error, a panic, or
//! cancellation of the holder always hands the lock on. Ownership passes
//! straight to the next waiter without an unlocked window in between.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Default)]
struct LockState {
    waiters: VecDeque<oneshot::Sender<()>>,
}

type LockTable = Arc<Mutex<HashMap<String, LockState>>>;

/// Registry of per-key locks. Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct AsyncKeyedLock {
    table: LockTable,
}

/// Proof of holding the lock for one key. Dropping it releases or hands off.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyedLockGuard {
    table: LockTable,
    key: String,
}

impl KeyedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        release(&self.table, &self.key);
    }
}

/// A queued acquisition. If it is dropped after ownership was already handed
/// to it, it passes ownership on instead of wedging the key.
struct PendingAcquire {
    rx: oneshot::Receiver<()>,
    table: LockTable,
    key: String,
    granted: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            release(&self.table, &self.key);
        }
    }
}

fn release(table: &LockTable, key: &str) {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(state) = table.get_mut(key) else {
        return;
    };
    while let Some(next) = state.waiters.pop_front() {
        // A waiter that has gone away refuses the handoff; try the next one.
        if next.send(()).is_ok() {
            trace!(key, "Keyed lock handed off");
            return;
        }
    }
    table.remove(key);
    trace!(key, "Keyed lock released");
}

impl AsyncKeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting in FIFO order behind earlier callers.
    pub async fn lock(&self, key: &str) -> KeyedLockGuard {
        let rx = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match table.get_mut(key) {
                None => {
                    table.insert(key.to_string(), LockState::default());
                    None
                }
                Some(state) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Some(rx)
                }
            }
        };

        let Some(rx) = rx else {
            return self.guard(key);
        };

        let mut pending = PendingAcquire {
            rx,
            table: Arc::clone(&self.table),
            key: key.to_string(),
            granted: false,
        };
        // `release` drops a waiter's sender only after sending on it, so the
        // only way this resolves is the handoff.
        let handed_off = (&mut pending.rx).await.is_ok();
        debug_assert!(handed_off, "keyed lock waiter lost its sender without a handoff");
        pending.granted = true;
        self.guard(key)
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// Whatever `f` returns (including an `Err`) is handed back to this caller
    /// only; the lock is released or handed off either way.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        f().await
    }

    /// Whether anyone currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of callers queued behind the holder of `key`. Waiters that
    /// gave up are not counted, even before the next release prunes them.
    pub fn waiting(&self, key: &str) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |state| {
                state.waiters.iter().filter(|tx| !tx.is_closed()).count()
            })
    }

    /// Number of keys with a live lock state.
    pub fn active_keys(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn guard(&self, key: &str) -> KeyedLockGuard {
        KeyedLockGuard {
            table: Arc::clone(&self.table),
            key: key.to_string(),
        }
    }
}
