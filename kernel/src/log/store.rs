// Log Storage Abstraction
//
// Defines the contract every store expects from the shared log.
// The log is owned elsewhere; stores only scan and append.

use serde_json::Value;

use super::{LogEntry, LogError};

/// Predicate applied to each entry during a scan.
pub type EntryFilter<'a> = dyn Fn(&LogEntry) -> bool + Send + Sync + 'a;

/// Storage backend for the shared log.
///
/// Properties required from implementations:
/// - Append-only
/// - Ordered by sequence, ascending
/// - Sequences unique and increasing across all traffic
///
/// Implementations MUST NOT:
/// - Reorder or mutate existing entries
/// - Partially apply a failed append
#[async_trait::async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Return every entry accepted by `filter`, ascending by sequence.
    ///
    /// Each call scans from the start.
    async fn scan(&self, filter: &EntryFilter<'_>) -> Result<Vec<LogEntry>, LogError>;

    /// Persist `content` as a new entry and return it with its assigned
    /// sequence.
    async fn append(&self, content: Value) -> Result<LogEntry, LogError>;
}
