//! Error types for the Vigil scheduling core.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use std::fmt;
use thiserror::Error;

/// The top-level error type for all Vigil operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Reasoning backend errors ---
    #[error("Brain error: {0}")]
    Brain(#[from] BrainError),

    // --- Triage errors ---
    #[error("Triage error: {0}")]
    Triage(#[from] TriageError),

    // --- Dispatch errors ---
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Perception errors ---
    #[error("Perception error: {0}")]
    Perception(#[from] PerceptionError),

    // --- Delegation errors ---
    #[error("Delegation error: {0}")]
    Delegation(#[from] DelegationError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the external reasoning backend.
#[derive(Debug, Clone, Error)]
pub enum BrainError {
    #[error("Backend request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Backend timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend returned an invalid reply: {0}")]
    InvalidReply(String),
}

/// Triage could not produce a decision. Always recovered locally.
#[derive(Debug, Clone, Error)]
pub enum TriageError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Classifier failed: {0}")]
    Failed(String),
}

/// Where a dispatch deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// Still waiting for a lane slot.
    Queued,
    /// Holding a slot, waiting on the backend.
    Executing,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::Queued => write!(f, "queued"),
            TimeoutStage::Executing => write!(f, "executing"),
        }
    }
}

/// A dispatched request reached a terminal failure.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Deadline expired while {stage} on lane '{lane}'")]
    LaneTimeout { lane: String, stage: TimeoutStage },

    #[error("Lane '{lane}' rejected the request: {waiting} requests already waiting")]
    LaneSaturated { lane: String, waiting: usize },

    #[error("Backend failed on lane '{lane}': {source}")]
    Backend {
        lane: String,
        #[source]
        source: BrainError,
    },

    #[error("Dispatcher is shutting down")]
    Closed,
}

impl DispatchError {
    /// Short machine-readable kind, used in `dispatch:failed` events.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::LaneTimeout { .. } => "timeout",
            DispatchError::LaneSaturated { .. } => "rejected",
            DispatchError::Backend { .. } => "backend",
            DispatchError::Closed => "closed",
        }
    }

    /// Message suitable for relaying back through the originating channel.
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::LaneTimeout { .. } => {
                "Sorry, that took too long and was cancelled. Please try again.".into()
            }
            DispatchError::LaneSaturated { .. } => {
                "I'm handling too many requests right now. Please try again shortly.".into()
            }
            DispatchError::Backend { .. } => {
                "Sorry, something went wrong while thinking about that.".into()
            }
            DispatchError::Closed => "The agent is shutting down.".into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },
}

/// A perception probe failed. Logged by the stream manager, never published.
#[derive(Debug, Clone, Error)]
pub enum PerceptionError {
    #[error("Source '{source_name}' timed out after {timeout_ms}ms")]
    Timeout { source_name: String, timeout_ms: u64 },

    #[error("Source '{source_name}' exited with code {code}: {stderr}")]
    CommandFailed {
        source_name: String,
        code: i32,
        stderr: String,
    },

    #[error("Source '{source_name}' failed: {reason}")]
    Failed { source_name: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum DelegationError {
    #[error("Failed to start delegate: {0}")]
    Spawn(String),

    #[error("Delegate I/O failed: {0}")]
    Io(String),

    #[error("Delegate exited with code {code}")]
    Exited { code: i32 },

    #[error("Delegate protocol error: {0}")]
    Protocol(String),
}
