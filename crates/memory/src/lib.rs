//! Memory store implementations for Vigil.
//!
//! The dispatcher only sees the `MemoryStore` trait from `vigil-core`; these
//! are the reference implementations a `Scheduler` can be wired with.

pub mod file_store;
pub mod in_memory;

pub use file_store::FileMemory;
pub use in_memory::InMemoryStore;

/// Keep at most the last `max_chars` characters of `text`, on a char boundary.
pub(crate) fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map_or(text.len(), |(idx, _)| idx);
    &text[start..]
}
