//! In-memory store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use vigil_core::error::MemoryError;
use vigil_core::memory::{ContextMode, MemoryEntry, MemoryStore};

/// Entries included in minimal context.
const MINIMAL_ENTRIES: usize = 5;

/// An in-memory store that keeps entries in a Vec.
/// Useful for testing and sessions where persistence isn't needed.
pub struct InMemoryStore {
    preamble: String,
    entries: Arc<RwLock<Vec<MemoryEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            preamble: String::new(),
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Fixed text placed at the top of every context.
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    pub async fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn build_context(&self, mode: ContextMode) -> Result<String, MemoryError> {
        let entries = self.entries.read().await;
        let skip = match mode {
            ContextMode::Minimal => entries.len().saturating_sub(MINIMAL_ENTRIES),
            ContextMode::Full => 0,
        };

        let mut context = self.preamble.clone();
        for entry in entries.iter().skip(skip) {
            if !context.is_empty() {
                context.push('\n');
            }
            context.push_str("- ");
            context.push_str(&entry.content);
        }
        Ok(context)
    }

    async fn append(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_render() {
        let mem = InMemoryStore::new().with_preamble("You are a helpful agent.");
        mem.append(MemoryEntry::new("User likes Rust")).await.unwrap();
        mem.append(MemoryEntry::new("Timezone is UTC+8")).await.unwrap();

        let context = mem.build_context(ContextMode::Full).await.unwrap();
        assert_eq!(
            context,
            "You are a helpful agent.\n- User likes Rust\n- Timezone is UTC+8"
        );
        assert_eq!(mem.count().await, 2);
    }

    #[tokio::test]
    async fn minimal_context_keeps_latest_entries() {
        let mem = InMemoryStore::new();
        for i in 0..8 {
            mem.append(MemoryEntry::new(format!("fact {i}"))).await.unwrap();
        }

        let minimal = mem.build_context(ContextMode::Minimal).await.unwrap();
        assert!(!minimal.contains("fact 2"));
        assert!(minimal.contains("fact 3"));
        assert!(minimal.contains("fact 7"));

        let full = mem.build_context(ContextMode::Full).await.unwrap();
        assert!(full.contains("fact 0"));
    }

    #[tokio::test]
    async fn empty_store_gives_empty_context() {
        let mem = InMemoryStore::default();
        assert_eq!(mem.build_context(ContextMode::Full).await.unwrap(), "");
        assert_eq!(mem.name(), "in_memory");
    }
}
