//! Perception streams for Vigil.
//!
//! Each perception source is an independent probe (a shell command, a closure)
//! run on its own cadence. The [`PerceptionStreamManager`] caches every
//! snapshot, hashes it, and publishes `perception:<name>` on the event bus
//! only when the content actually changed.

pub mod manager;
pub mod source;

pub use manager::{CachedResult, PerceptionStreamManager, SourceStats, TickOutcome};
pub use source::{Cadence, CommandSource, FnSource, PerceptionSource, SourceSpec};
