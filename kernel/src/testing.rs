// Test doubles for the log contract.

use std::sync::Mutex;

use serde_json::Value;

use crate::log::{EntryFilter, LogEntry, LogError, LogStore, MemoryLogStore};

/// In-memory log that can be told to refuse an upcoming append.
#[derive(Debug, Default)]
pub(crate) struct FlakyLog {
    inner: MemoryLogStore,
    fail_after: Mutex<Option<usize>>,
}

impl FlakyLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next_append(&self) {
        self.fail_append_after(0);
    }

    /// Let `successes` appends through, then refuse one.
    pub(crate) fn fail_append_after(&self, successes: usize) {
        *self.fail_after.lock().unwrap() = Some(successes);
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.len().await
    }
}

#[async_trait::async_trait]
impl LogStore for FlakyLog {
    async fn scan(&self, filter: &EntryFilter<'_>) -> Result<Vec<LogEntry>, LogError> {
        self.inner.scan(filter).await
    }

    async fn append(&self, content: Value) -> Result<LogEntry, LogError> {
        let refuse = {
            let mut armed = self.fail_after.lock().unwrap();
            match *armed {
                Some(0) => {
                    *armed = None;
                    true
                }
                Some(n) => {
                    *armed = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if refuse {
            return Err(LogError::Rejected("injected failure".into()));
        }
        self.inner.append(content).await
    }
}

/// Log whose every call fails.
#[derive(Debug)]
pub(crate) struct BrokenLog;

#[async_trait::async_trait]
impl LogStore for BrokenLog {
    async fn scan(&self, _: &EntryFilter<'_>) -> Result<Vec<LogEntry>, LogError> {
        Err(LogError::Io("disk on fire".into()))
    }

    async fn append(&self, _: Value) -> Result<LogEntry, LogError> {
        Err(LogError::Io("disk on fire".into()))
    }
}
