//! # Vigil Dispatch
//!
//! The single ingress for requests that need the brain. A request is
//! triaged into the fast or full lane, waits for a slot on that lane's
//! semaphore, and is answered with a context matched to the lane. Action
//! tags in the reply become delegations and memories.

pub mod dispatcher;
pub mod lane;
pub mod tags;
pub mod triage;

pub use dispatcher::{DispatchRequest, DispatchResponse, Dispatcher};
pub use lane::{Lane, LaneKind, LanePermit, LaneStats};
pub use tags::{DelegateTag, ParsedReply, RememberTag, parse_reply};
pub use triage::{Classifier, DEFAULT_TRIAGE_TIMEOUT, PatternClassifier, TriageDecision, triage};
