// File-Backed Log
//
// One JSON entry per line. The whole file is read into memory on open;
// appends write a line and only then become visible to scans. A failed
// append is cut back off the file so it never half-applies.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::{EntryFilter, EntryId, LogEntry, LogError, LogStore};
use crate::config::LogConfig;

/// Open file plus the byte length of its committed prefix.
#[derive(Debug)]
struct Tail {
    file: File,
    len: u64,
}

/// Durable log stored as JSON lines.
#[derive(Debug)]
pub struct FileLogStore {
    sync_on_write: bool,
    entries: RwLock<Vec<LogEntry>>,
    tail: Mutex<Tail>,
    /// Set when a failed append could not be rolled back.
    poisoned: AtomicBool,
    #[cfg(test)]
    fail_next_sync: AtomicBool,
}

impl FileLogStore {
    /// Open (or create) the log described by `config`.
    #[instrument(skip_all, fields(path = %config.path.display()))]
    pub async fn open(config: &LogConfig) -> Result<Self, LogError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let text = match tokio::fs::read_to_string(&config.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let (entries, valid_len) = parse_lines(&text)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await?;

        if valid_len < text.len() {
            warn!(
                kept = valid_len,
                dropped = text.len() - valid_len,
                "Discarding torn trailing line"
            );
            file.set_len(valid_len as u64).await?;
        }

        info!(entries = entries.len(), "Opened file log");

        Ok(Self {
            sync_on_write: config.sync_on_write,
            entries: RwLock::new(entries),
            tail: Mutex::new(Tail {
                file,
                len: valid_len as u64,
            }),
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_sync: AtomicBool::new(false),
        })
    }

    async fn write_line(&self, file: &mut File, line: &[u8]) -> Result<(), LogError> {
        file.write_all(line).await?;
        file.flush().await?;
        if self.take_injected_fault() {
            return Err(LogError::Io("injected sync failure".into()));
        }
        if self.sync_on_write {
            file.sync_all().await?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn take_injected_fault(&self) -> bool {
        self.fail_next_sync.swap(false, Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn take_injected_fault(&self) -> bool {
        false
    }
}

/// Parse every complete line. Returns the entries and the byte length of
/// the prefix that parsed cleanly.
fn parse_lines(text: &str) -> Result<(Vec<LogEntry>, usize), LogError> {
    let mut entries: Vec<LogEntry> = Vec::new();
    let mut offset = 0;

    for (index, raw) in text.split_inclusive('\n').enumerate() {
        let line = index + 1;
        let terminated = raw.ends_with('\n');
        let body = raw.trim_end();

        if body.is_empty() {
            offset += raw.len();
            continue;
        }

        match serde_json::from_str::<LogEntry>(body) {
            Ok(entry) => {
                if let Some(prev) = entries.last() {
                    if entry.sequence <= prev.sequence {
                        return Err(LogError::Corrupt {
                            line,
                            reason: format!(
                                "sequence {} does not follow {}",
                                entry.sequence, prev.sequence
                            ),
                        });
                    }
                }
                if !terminated {
                    // Valid entry but the newline never made it to disk.
                    return Ok((entries, offset));
                }
                entries.push(entry);
                offset += raw.len();
            }
            Err(_) if !terminated => return Ok((entries, offset)),
            Err(e) => {
                return Err(LogError::Corrupt {
                    line,
                    reason: e.to_string(),
                })
            }
        }
    }

    Ok((entries, offset))
}

#[async_trait::async_trait]
impl LogStore for FileLogStore {
    async fn scan(&self, filter: &EntryFilter<'_>) -> Result<Vec<LogEntry>, LogError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| filter(*e)).cloned().collect())
    }

    async fn append(&self, content: Value) -> Result<LogEntry, LogError> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(LogError::Rejected(
                "an earlier failed append could not be rolled back".into(),
            ));
        }

        let mut entries = self.entries.write().await;
        let sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(1);
        let entry = LogEntry {
            id: EntryId::new(),
            sequence,
            content,
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut tail = self.tail.lock().await;
        let Tail { file, len } = &mut *tail;
        if let Err(e) = self.write_line(file, line.as_bytes()).await {
            warn!(sequence, error = %e, "Append failed, truncating");
            if let Err(undo) = file.set_len(*len).await {
                error!(error = %undo, "Truncation failed, refusing further appends");
                self.poisoned.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }
        *len += line.len() as u64;

        debug!(sequence, "Appended entry");
        entries.push(entry.clone());
        Ok(entry)
    }
}
