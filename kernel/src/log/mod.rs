// Shared Append-Only Log
//
// Entries are immutable and sequence-numbered. Content is opaque JSON so
// that record, set and unrelated traffic can share one log.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod file;
pub mod store;

pub use file::FileLogStore;
pub use store::{EntryFilter, LogStore};

/// Position assigned by the log. Starts at 1.
pub type Sequence = u64;

/// Stable identifier for a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntryId,
    pub sequence: Sequence,
    pub content: Value,
}

/// Which keyed structure an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureTag {
    Record,
    Set,
}

impl StructureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureTag::Record => "record",
            StructureTag::Set => "set",
        }
    }

    /// True when `entry` carries this tag in its `structure` field.
    pub fn owns(&self, entry: &LogEntry) -> bool {
        entry.content.get("structure").and_then(Value::as_str) == Some(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt log at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("append rejected: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LogError {
    fn from(err: serde_json::Error) -> Self {
        LogError::Serialization(err.to_string())
    }
}

/// Volatile log kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl LogStore for MemoryLogStore {
    async fn scan(&self, filter: &EntryFilter<'_>) -> Result<Vec<LogEntry>, LogError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| filter(*e)).cloned().collect())
    }

    async fn append(&self, content: Value) -> Result<LogEntry, LogError> {
        let mut entries = self.entries.write().await;
        let sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(1);
        let entry = LogEntry {
            id: EntryId::new(),
            sequence,
            content,
        };
        entries.push(entry.clone());
        Ok(entry)
    }
}
