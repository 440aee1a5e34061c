//! # Vigil Core
//!
//! The leaf crate of the Vigil scheduling core: the event bus, time-shaping
//! combinators, the per-key async lock, the collaborator traits the
//! scheduler consumes (`Brain`, `MemoryStore`), and the error taxonomy.
//!
//! Every other crate in the workspace depends inward on this one. Nothing
//! here holds process-wide state; each `Scheduler` owns its own instances.

pub mod brain;
pub mod error;
pub mod event;
pub mod lock;
pub mod memory;
pub mod reactive;

// Re-export key types at crate root for ergonomics
pub use brain::{Brain, BrainReply};
pub use error::{
    BrainError, DelegationError, DispatchError, Error, MemoryError, PerceptionError, Result,
    TimeoutStage, TriageError,
};
pub use event::{Event, EventBus, EventPattern, Subscriber, SubscriptionId, handler};
pub use lock::{AsyncKeyedLock, KeyedLockGuard};
pub use memory::{ContextMode, MemoryEntry, MemoryStore};
pub use reactive::{
    Debounced, DistinctUntilChanged, Throttled, debounce, distinct_until_changed, throttle,
};
