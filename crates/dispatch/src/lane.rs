//! Lanes: named, concurrency-bounded paths to the brain.
//!
//! Each lane owns a fair semaphore with a fixed number of slots. Callers
//! wait for a slot in FIFO order; the only ways out of the queue are getting
//! a slot, the caller's own deadline expiring, or the lane's optional
//! `max_waiting` bound rejecting them up front.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{Instant, timeout_at};
use vigil_config::LaneConfig;
use vigil_core::error::{DispatchError, TimeoutStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    /// Short replies with minimal context
    Fast,
    /// Full reasoning with full context
    Full,
}

impl LaneKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LaneKind::Fast => "fast",
            LaneKind::Full => "full",
        }
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time counters for one lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub name: String,
    pub in_flight: usize,
    pub limit: usize,
    pub waiting: usize,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

pub struct Lane {
    kind: LaneKind,
    semaphore: Semaphore,
    limit: usize,
    timeout: Duration,
    max_waiting: Option<usize>,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl Lane {
    pub fn new(kind: LaneKind, limit: usize, timeout: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            kind,
            semaphore: Semaphore::new(limit),
            limit,
            timeout,
            max_waiting: None,
            in_flight: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn from_config(kind: LaneKind, config: &LaneConfig) -> Self {
        Self::new(kind, config.limit, Duration::from_secs(config.timeout_secs))
            .with_max_waiting(config.max_waiting)
    }

    pub fn with_max_waiting(mut self, max_waiting: Option<usize>) -> Self {
        self.max_waiting = max_waiting;
        self
    }

    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    /// Backend timeout for calls on this lane.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for a slot. `deadline` bounds the wait; `None` waits as long as
    /// it takes.
    pub async fn acquire(
        &self,
        deadline: Option<Instant>,
    ) -> Result<LanePermit<'_>, DispatchError> {
        let max_waiting = self.max_waiting;
        let admitted = self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| match max_waiting {
                Some(max) if waiting >= max && self.semaphore.available_permits() == 0 => None,
                _ => Some(waiting + 1),
            });
        if let Err(waiting) = admitted {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(DispatchError::LaneSaturated {
                lane: self.kind.to_string(),
                waiting,
            });
        }
        let _queued = Queued(&self.waiting);

        let acquired = match deadline {
            Some(deadline) => match timeout_at(deadline, self.semaphore.acquire()).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    self.rejected.fetch_add(1, Ordering::SeqCst);
                    return Err(DispatchError::LaneTimeout {
                        lane: self.kind.to_string(),
                        stage: TimeoutStage::Queued,
                    });
                }
            },
            None => self.semaphore.acquire().await,
        };
        let permit = acquired.map_err(|_| DispatchError::Closed)?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(LanePermit {
            lane: self,
            succeeded: false,
            _permit: permit,
        })
    }

    /// Refuse all waiting and future requests.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn stats(&self) -> LaneStats {
        LaneStats {
            name: self.kind.to_string(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            limit: self.limit,
            waiting: self.waiting.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the waiting count however the wait ends.
struct Queued<'a>(&'a AtomicUsize);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A held lane slot. Dropping it frees the slot and records the outcome;
/// a permit dropped without [`LanePermit::succeed`] counts as failed.
pub struct LanePermit<'a> {
    lane: &'a Lane,
    succeeded: bool,
    _permit: SemaphorePermit<'a>,
}

impl LanePermit<'_> {
    pub fn succeed(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for LanePermit<'_> {
    fn drop(&mut self) {
        self.lane.in_flight.fetch_sub(1, Ordering::SeqCst);
        let counter = if self.succeeded {
            &self.lane.completed
        } else {
            &self.lane.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}
