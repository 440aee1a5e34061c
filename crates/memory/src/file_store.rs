//! File-based memory store: human-editable markdown plus a JSONL journal.
//!
//! Layout under the memory directory:
//!
//! ```text
//! MEMORY.md              long-term knowledge, grouped by `## Section`
//! HEARTBEAT.md           active tasks and standing instructions
//! daily/YYYY-MM-DD.md    today's notes
//! entries.jsonl          one JSON-encoded MemoryEntry per appended memory
//! ```
//!
//! Every read-modify-write runs under `AsyncKeyedLock::with_lock(path, ..)`,
//! so concurrent appends from the dispatcher and other writers never lose
//! updates. Reads are lock-free.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vigil_core::error::MemoryError;
use vigil_core::lock::AsyncKeyedLock;
use vigil_core::memory::{ContextMode, MemoryEntry, MemoryStore};

use crate::tail_chars;

/// Section used when an entry carries no tag.
pub const DEFAULT_SECTION: &str = "Learned Patterns";

const HEARTBEAT_TEMPLATE: &str = "# HEARTBEAT\n\n## Active Tasks\n";

/// A line of a memory file matching a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// File name relative to the memory directory
    pub file: String,
    pub line: String,
}

pub struct FileMemory {
    dir: PathBuf,
    locks: AsyncKeyedLock,
    minimal_chars: usize,
    full_chars: usize,
}

impl FileMemory {
    /// Create a store rooted at `dir`. Files are created on first write.
    ///
    /// `locks` should be the scheduler's shared lock registry so every writer
    /// of these files serializes on the same keys.
    pub fn new(dir: impl Into<PathBuf>, locks: AsyncKeyedLock) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "File memory store opened");
        Self {
            dir,
            locks,
            minimal_chars: 2_000,
            full_chars: 32_000,
        }
    }

    /// Character budgets for minimal and full context.
    pub fn with_limits(mut self, minimal_chars: usize, full_chars: usize) -> Self {
        self.minimal_chars = minimal_chars;
        self.full_chars = full_chars;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn memory_path(&self) -> PathBuf {
        self.dir.join("MEMORY.md")
    }

    fn heartbeat_path(&self) -> PathBuf {
        self.dir.join("HEARTBEAT.md")
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join("entries.jsonl")
    }

    fn daily_path(&self) -> PathBuf {
        self.dir.join("daily").join(format!("{}.md", today()))
    }

    pub async fn read_memory(&self) -> Result<String, MemoryError> {
        read_or_empty(&self.memory_path()).await
    }

    pub async fn read_daily_notes(&self) -> Result<String, MemoryError> {
        read_or_empty(&self.daily_path()).await
    }

    pub async fn read_heartbeat(&self) -> Result<String, MemoryError> {
        read_or_empty(&self.heartbeat_path()).await
    }

    /// Add a dated bullet under `## {section}` in MEMORY.md, creating the
    /// section at the end if it does not exist yet.
    pub async fn append_memory(&self, content: &str, section: &str) -> Result<(), MemoryError> {
        let path = self.memory_path();
        let path = &path;
        let header = format!("## {section}");
        let bullet = format!("\n- [{}] {}", today(), content.trim());

        self.locks
            .with_lock(&lock_key(path), || async move {
                let current = read_or_empty(path).await?;
                let updated = if current.contains(&header) {
                    current.replacen(&header, &format!("{header}{bullet}"), 1)
                } else {
                    format!("{current}\n{header}{bullet}\n")
                };
                write_file(path, &updated).await
            })
            .await
    }

    /// Append a timestamped line to today's notes.
    pub async fn append_daily_note(&self, content: &str) -> Result<(), MemoryError> {
        let path = self.daily_path();
        let path = &path;
        let line = format!("\n[{}] {}", Utc::now().format("%H:%M:%S"), content.trim());

        self.locks
            .with_lock(&lock_key(path), || async move {
                let mut current = read_or_empty(path).await?;
                if current.is_empty() {
                    current = format!("# Daily Notes - {}\n", today());
                }
                current.push_str(&line);
                write_file(path, &current).await
            })
            .await
    }

    /// Replace HEARTBEAT.md entirely.
    pub async fn update_heartbeat(&self, content: &str) -> Result<(), MemoryError> {
        let path = self.heartbeat_path();
        let path = &path;
        self.locks
            .with_lock(&lock_key(path), || async move { write_file(path, content).await })
            .await
    }

    /// Add an unchecked task under `## Active Tasks` in HEARTBEAT.md.
    pub async fn add_task(&self, task: &str, schedule: Option<&str>) -> Result<(), MemoryError> {
        let path = self.heartbeat_path();
        let path = &path;
        let schedule_note = schedule.map(|s| format!(" ({s})")).unwrap_or_default();
        let entry = format!(
            "\n- [ ] {}{} <!-- added: {} -->",
            task.trim(),
            schedule_note,
            Utc::now().to_rfc3339()
        );

        self.locks
            .with_lock(&lock_key(path), || async move {
                let mut current = read_or_empty(path).await?;
                if current.is_empty() {
                    current = HEARTBEAT_TEMPLATE.to_string();
                }
                let updated = if current.contains("## Active Tasks") {
                    current.replacen("## Active Tasks", &format!("## Active Tasks{entry}"), 1)
                } else {
                    format!("{current}\n## Active Tasks{entry}\n")
                };
                write_file(path, &updated).await
            })
            .await
    }

    /// Case-insensitive line search over MEMORY.md, HEARTBEAT.md and today's notes.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, MemoryError> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for path in [self.memory_path(), self.heartbeat_path(), self.daily_path()] {
            let content = read_or_empty(&path).await?;
            let file = path
                .strip_prefix(&self.dir)
                .unwrap_or(&path)
                .display()
                .to_string();
            for line in content.lines().filter(|l| l.to_lowercase().contains(&needle)) {
                if hits.len() >= max_results {
                    return Ok(hits);
                }
                hits.push(SearchHit {
                    file: file.clone(),
                    line: line.trim().to_string(),
                });
            }
        }
        Ok(hits)
    }

    /// Every entry recorded through [`MemoryStore::append`], oldest first.
    /// Corrupted journal lines are skipped.
    pub async fn entries(&self) -> Result<Vec<MemoryEntry>, MemoryError> {
        let content = read_or_empty(&self.journal_path()).await?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<MemoryEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted memory entry");
                    None
                }
            })
            .collect())
    }

    async fn append_journal(&self, entry: &MemoryEntry) -> Result<(), MemoryError> {
        let path = self.journal_path();
        let path = &path;
        let line = serde_json::to_string(entry).map_err(|e| {
            MemoryError::Storage(format!("Failed to serialize memory entry: {e}"))
        })?;

        self.locks
            .with_lock(&lock_key(path), || async move {
                let mut current = read_or_empty(path).await?;
                current.push_str(&line);
                current.push('\n');
                write_file(path, &current).await
            })
            .await
    }
}

#[async_trait]
impl MemoryStore for FileMemory {
    fn name(&self) -> &str {
        "file"
    }

    async fn build_context(&self, mode: ContextMode) -> Result<String, MemoryError> {
        let (memory, heartbeat) = tokio::try_join!(self.read_memory(), self.read_heartbeat())?;

        let context = match mode {
            ContextMode::Minimal => {
                // Most recent knowledge sits at the top of each section, so
                // keep the head of MEMORY.md and drop daily notes entirely.
                let budget = self.minimal_chars.saturating_sub(heartbeat.chars().count());
                let memory: String = memory.chars().take(budget).collect();
                format!("<memory>\n{memory}\n</memory>\n\n<heartbeat>\n{heartbeat}\n</heartbeat>")
            }
            ContextMode::Full => {
                let daily = self.read_daily_notes().await?;
                let daily = tail_chars(&daily, self.full_chars / 4);
                let budget = self
                    .full_chars
                    .saturating_sub(heartbeat.chars().count() + daily.chars().count());
                let memory: String = memory.chars().take(budget).collect();
                format!(
                    "<memory>\n{memory}\n</memory>\n\n<today>\n{daily}\n</today>\n\n<heartbeat>\n{heartbeat}\n</heartbeat>"
                )
            }
        };
        Ok(context)
    }

    async fn append(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        let section = entry
            .tags
            .first()
            .map_or(DEFAULT_SECTION, String::as_str);
        self.append_memory(&entry.content, section).await?;
        self.append_journal(&entry).await?;
        debug!(id = %entry.id, section, "Memory appended");
        Ok(())
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn lock_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn read_or_empty(path: &Path) -> Result<String, MemoryError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(MemoryError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

async fn write_file(path: &Path, content: &str) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MemoryError::Io {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| MemoryError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
