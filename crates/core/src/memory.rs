//! Memory trait: the long-term context store consumed by the dispatcher.
//!
//! The scheduling core treats memory as a collaborator with two operations:
//! render a context string for a prompt, and append a new entry. How the
//! content is stored is up to the implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::MemoryError;

/// How much context a caller wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Just enough for a quick reply (fast lane)
    Minimal,
    /// Everything relevant (full lane)
    #[default]
    Full,
}

/// A single memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique ID for this memory
    pub id: String,

    /// The content of the memory
    pub content: String,

    /// Where the memory came from (dispatch source, delegation id, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Tags for categorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// When this memory was created
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: format!("mem_{}", uuid::Uuid::new_v4().simple()),
            content: content.into(),
            source: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// The core MemoryStore trait.
///
/// Implementations: file-backed (markdown + JSONL), in-memory (for testing).
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// The store name (e.g., "file", "in_memory").
    fn name(&self) -> &str;

    /// Render the context string handed to the brain.
    async fn build_context(&self, mode: ContextMode) -> std::result::Result<String, MemoryError>;

    /// Persist a new entry.
    async fn append(&self, entry: MemoryEntry) -> std::result::Result<(), MemoryError>;
}
