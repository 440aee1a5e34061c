//! Background delegation for Vigil.
//!
//! A delegation hands a multi-turn task (typically a coding task for a CLI
//! agent) to a bounded pool: at most `max_concurrent` tasks run, the rest
//! wait in FIFO order. `spawn` returns an id at once; progress is visible via
//! `status` and `delegation:*` events on the bus.

pub mod executor;
pub mod runner;
pub mod task;

pub use executor::{DelegationExecutor, DelegationLimits};
pub use runner::{
    CommandRunner, DELEGATION_MARKER, DelegateEnvironment, DelegateRequest, DelegateRunner,
    DelegateSession, Turn,
};
pub use task::{DelegationTask, TaskId, TaskSpec, TaskStatus, VerifyResult};
