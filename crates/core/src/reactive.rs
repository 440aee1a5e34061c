//! Time-shaping combinators: debounce, throttle, distinct-until-changed.
//!
//! These are independent of the [`EventBus`](crate::event::EventBus); they wrap
//! plain callbacks. All clocks are `tokio::time::Instant`, so tests can drive
//! them with a paused runtime clock.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

struct DebounceState {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

struct DebounceInner<T> {
    f: Callback<T>,
    delay: Duration,
    state: Mutex<DebounceState>,
}

/// A callback that fires once `delay` has passed without another call.
///
/// Must be called from within a tokio runtime; the delay runs on a spawned task.
pub struct Debounced<T> {
    inner: Arc<DebounceInner<T>>,
}

impl<T> Clone for Debounced<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Delay `f` until `delay` has elapsed since the most recent call.
pub fn debounce<T, F>(f: F, delay: Duration) -> Debounced<T>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Debounced {
        inner: Arc::new(DebounceInner {
            f: Box::new(f),
            delay,
            state: Mutex::new(DebounceState {
                generation: 0,
                pending: None,
            }),
        }),
    }
}

impl<T: Send + 'static> Debounced<T> {
    /// Schedule a call with `arg`, replacing any pending one.
    pub fn call(&self, arg: T) {
        let deadline = Instant::now() + self.inner.delay;
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        let generation = state.generation;
        if let Some(previous) = state.pending.take() {
            previous.abort();
        }

        let inner = Arc::clone(&self.inner);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // A newer call or a cancel bumps the generation; only the latest fires.
            let fire = {
                let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.generation == generation {
                    state.pending = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                (inner.f)(arg);
            }
        }));
    }

    /// Drop the pending call, if any. It will never fire.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .is_some()
    }
}

/// A callback that runs at most once per `interval`.
pub struct Throttled<T> {
    f: Callback<T>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

/// Invoke `f` immediately, then suppress calls until `interval` has elapsed
/// since the last actual invocation. Uses clock comparisons, not timers.
pub fn throttle<T, F>(f: F, interval: Duration) -> Throttled<T>
where
    F: Fn(T) + Send + Sync + 'static,
{
    Throttled {
        f: Box::new(f),
        interval,
        last: Mutex::new(None),
    }
}

impl<T> Throttled<T> {
    /// Returns whether the call went through.
    pub fn call(&self, arg: T) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let due = match *last {
                None => true,
                Some(previous) => now.duration_since(previous) >= self.interval,
            };
            if !due {
                return false;
            }
            *last = Some(now);
        }
        (self.f)(arg);
        true
    }
}

/// Stateful change predicate over a hash of each value.
pub struct DistinctUntilChanged<T: ?Sized, F> {
    hash_fn: F,
    last: Option<String>,
    _value: PhantomData<fn(&T)>,
}

pub fn distinct_until_changed<T, F>(hash_fn: F) -> DistinctUntilChanged<T, F>
where
    T: ?Sized,
    F: Fn(&T) -> String,
{
    DistinctUntilChanged {
        hash_fn,
        last: None,
        _value: PhantomData,
    }
}

impl<T: ?Sized, F: Fn(&T) -> String> DistinctUntilChanged<T, F> {
    /// True on the first call and whenever the hash differs from the last one.
    pub fn changed(&mut self, value: &T) -> bool {
        let hash = (self.hash_fn)(value);
        if self.last.as_deref() == Some(hash.as_str()) {
            return false;
        }
        self.last = Some(hash);
        true
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last.as_deref()
    }
}
