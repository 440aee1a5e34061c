//! Brain trait: the abstraction over the expensive reasoning backend.
//!
//! The scheduling core never talks to an LLM directly. It hands a prompt and
//! a pre-built context string to a `Brain` and waits, bounded by a timeout,
//! for a text reply. Concurrency towards the brain is limited by the
//! dispatcher's lanes, not by implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::error::BrainError;

/// A complete reply from the reasoning backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainReply {
    /// The generated text, possibly containing action tags
    pub text: String,

    /// Which model actually answered, if the backend reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BrainReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }
}

/// The core Brain trait.
///
/// Implementations must give up once `timeout` has elapsed and return
/// [`BrainError::Timeout`]; the dispatcher additionally enforces the bound.
#[async_trait]
pub trait Brain: Send + Sync {
    /// A human-readable name for this backend (e.g., "claude-cli", "mock").
    fn name(&self) -> &str;

    /// Send a prompt with its context and wait for the reply.
    async fn invoke(
        &self,
        prompt: &str,
        context: &str,
        timeout: Duration,
    ) -> std::result::Result<BrainReply, BrainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Brain for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            prompt: &str,
            context: &str,
            _timeout: Duration,
        ) -> std::result::Result<BrainReply, BrainError> {
            Ok(BrainReply::text(format!("{context}|{prompt}")))
        }
    }

    #[tokio::test]
    async fn brain_is_object_safe() {
        let brain: Box<dyn Brain> = Box::new(Echo);
        let reply = brain
            .invoke("hi", "ctx", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.text, "ctx|hi");
        assert_eq!(brain.name(), "echo");
    }

    #[test]
    fn reply_serialization_skips_missing_model() {
        let json = serde_json::to_string(&BrainReply::text("ok")).unwrap();
        assert_eq!(json, r#"{"text":"ok"}"#);
    }
}
