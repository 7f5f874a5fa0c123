// Bounded-Replay Keyed Log
//
// Shared core of the record and set stores: one-shot replay at open,
// a readiness signal, serialized mutation of the sequence index, and the
// snapshot-then-commit append path.

use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::invariants::{EntryStamp, InvariantEngine, InvariantViolation};
use crate::log::{LogEntry, LogError, LogStore, Sequence};
use crate::replay::{own_entries, replay_index, Structure};
use crate::squeeze::SqueezePlan;
use crate::state::SequenceIndex;

pub mod record;
pub mod set;

pub use record::{Record, RecordContent, RecordStore, RecordStructure};
pub use set::{SetContent, SetOp, SetStore, SetStructure};

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The initial replay failed; the store is unusable.
    #[error("store failed to load: {0}")]
    Load(String),

    #[error("scan failed: {0}")]
    Scan(#[source] LogError),

    /// The log refused the entry. The index is unchanged.
    #[error("append failed: {0}")]
    Append(#[source] LogError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("failed to encode entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoadState {
    Pending,
    Ready,
    Failed(String),
}

/// A keyed structure `S` kept in log `L`.
pub struct KeyedLog<L: LogStore, S: Structure> {
    log: Arc<L>,
    index: Arc<Mutex<SequenceIndex<S::Key>>>,
    ready: watch::Receiver<LoadState>,
    invariants: Arc<InvariantEngine>,
}

impl<L: LogStore, S: Structure> KeyedLog<L, S> {
    /// Start replaying `log` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(log: Arc<L>) -> Self {
        let index = Arc::new(Mutex::new(SequenceIndex::new()));
        let invariants = Arc::new(InvariantEngine::standard());
        let (tx, ready) = watch::channel(LoadState::Pending);

        let task_log = Arc::clone(&log);
        let task_index = Arc::clone(&index);
        let task_invariants = Arc::clone(&invariants);
        tokio::spawn(async move {
            let state = match replay_index::<S, L>(task_log.as_ref(), &task_invariants).await {
                Ok(replayed) => {
                    info!(
                        structure = S::TAG.as_str(),
                        oldest = replayed.oldest(),
                        latest = replayed.latest(),
                        live = replayed.live_len(),
                        "Replay complete"
                    );
                    *task_index.lock().await = replayed;
                    LoadState::Ready
                }
                Err(e) => {
                    error!(structure = S::TAG.as_str(), error = %e, "Replay failed");
                    LoadState::Failed(e.to_string())
                }
            };
            tx.send_replace(state);
        });

        Self {
            log,
            index,
            ready,
            invariants,
        }
    }

    /// Resolves once replay has finished.
    pub async fn loaded(&self) -> Result<(), StoreError> {
        let mut ready = self.ready.clone();
        let state = match ready.wait_for(|s| *s != LoadState::Pending).await {
            Ok(state) => LoadState::clone(&state),
            Err(_) => return Err(StoreError::Load("replay task exited early".into())),
        };

        match state {
            LoadState::Failed(reason) => Err(StoreError::Load(reason)),
            _ => Ok(()),
        }
    }

    /// Own entries in sequence order, freshly scanned.
    pub async fn entries(&self) -> Result<Vec<(Sequence, S::Content)>, StoreError> {
        self.loaded().await?;
        own_entries::<S, L>(self.log.as_ref())
            .await
            .map_err(StoreError::Scan)
    }

    /// Exclusive access to the index. Held for the whole of a mutation.
    pub(crate) async fn lock(&self) -> Result<MutexGuard<'_, SequenceIndex<S::Key>>, StoreError> {
        self.loaded().await?;
        Ok(self.index.lock().await)
    }

    /// Append `content` and, only if the log accepts it, replace `index`
    /// with `next`.
    ///
    /// `next` must already hold every key in `defined` at the tentative
    /// sequence; those keys are moved to the sequence the log assigns.
    pub(crate) async fn commit(
        &self,
        index: &mut SequenceIndex<S::Key>,
        mut next: SequenceIndex<S::Key>,
        oldest: Sequence,
        content: S::Content,
        defined: Vec<S::Key>,
    ) -> Result<LogEntry, StoreError> {
        let tentative = index.next_sequence();
        let mut planned = next.clone();
        planned.advance(tentative, oldest);
        self.invariants.evaluate(
            &index.view(),
            &EntryStamp {
                sequence: tentative,
                oldest_hint: oldest,
            },
            &planned.view(),
        )?;

        let value = serde_json::to_value(&content)?;
        let entry = self.log.append(value).await.map_err(|e| {
            warn!(
                structure = S::TAG.as_str(),
                error = %e,
                "Append failed, index untouched"
            );
            StoreError::Append(e)
        })?;

        for key in defined {
            next.define(key, entry.sequence);
        }
        next.advance(entry.sequence, oldest);
        *index = next;

        debug!(
            structure = S::TAG.as_str(),
            sequence = entry.sequence,
            oldest,
            "Committed entry"
        );
        Ok(entry)
    }

    pub async fn oldest(&self) -> Result<Sequence, StoreError> {
        Ok(self.lock().await?.oldest())
    }

    pub async fn latest(&self) -> Result<Sequence, StoreError> {
        Ok(self.lock().await?.latest())
    }

    pub async fn squeeze_potential(&self) -> Result<i64, StoreError> {
        Ok(self.lock().await?.squeeze_potential())
    }

    pub async fn plan(&self) -> Result<SqueezePlan<S::Key>, StoreError> {
        Ok(SqueezePlan::of(&*self.lock().await?))
    }

    /// Copy of the current index.
    pub async fn snapshot(&self) -> Result<SequenceIndex<S::Key>, StoreError> {
        Ok(self.lock().await?.clone())
    }
}

impl<L: LogStore, S: Structure> std::fmt::Debug for KeyedLog<L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLog")
            .field("structure", &S::TAG)
            .field("ready", &*self.ready.borrow())
            .finish_non_exhaustive()
    }
}
