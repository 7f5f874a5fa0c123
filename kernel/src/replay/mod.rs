// Deterministic Replay Engine
//
// Rebuilds a structure's sequence index from the shared log while
// enforcing window invariants entry by entry.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::invariants::{EntryStamp, InvariantEngine, InvariantViolation};
use crate::log::{LogEntry, LogError, LogStore, Sequence, StructureTag};
use crate::state::SequenceIndex;

/// A keyed structure living in the shared log.
///
/// `fold` is the per-key merge rule: how one own entry changes which keys
/// are live and where each was last defined.
pub trait Structure: Send + Sync + 'static {
    const TAG: StructureTag;

    type Key: Clone + Ord + Debug + Send + Sync + 'static;
    type Content: Serialize + DeserializeOwned + Debug + Send + Sync + 'static;

    fn oldest_hint(content: &Self::Content) -> Sequence;

    fn fold(index: &mut SequenceIndex<Self::Key>, sequence: Sequence, content: &Self::Content);
}

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Scan the log for entries tagged `S::TAG` and decode them.
///
/// Own-tagged entries whose content does not decode are skipped.
pub async fn own_entries<S, L>(log: &L) -> Result<Vec<(Sequence, S::Content)>, LogError>
where
    S: Structure,
    L: LogStore + ?Sized,
{
    let entries = log.scan(&|e: &LogEntry| S::TAG.owns(e)).await?;
    Ok(entries.into_iter().filter_map(decode::<S>).collect())
}

fn decode<S: Structure>(entry: LogEntry) -> Option<(Sequence, S::Content)> {
    match serde_json::from_value::<S::Content>(entry.content) {
        Ok(content) => Some((entry.sequence, content)),
        Err(e) => {
            warn!(
                structure = S::TAG.as_str(),
                sequence = entry.sequence,
                error = %e,
                "Skipping malformed entry"
            );
            None
        }
    }
}

/// Replay the log and derive the structure's sequence index.
///
/// Every own-tagged entry advances the window, even one whose payload
/// does not decode; such an entry just defines no keys.
///
/// This is the only way an index is built from scratch.
pub async fn replay_index<S, L>(
    log: &L,
    invariants: &InvariantEngine,
) -> Result<SequenceIndex<S::Key>, ReplayError>
where
    S: Structure,
    L: LogStore + ?Sized,
{
    let mut index = SequenceIndex::new();

    for entry in log.scan(&|e: &LogEntry| S::TAG.owns(e)).await? {
        let previous = index.view();
        let sequence = entry.sequence;
        let raw_hint = entry
            .content
            .get("oldest")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let oldest_hint = match decode::<S>(entry) {
            Some((_, content)) => {
                S::fold(&mut index, sequence, &content);
                S::oldest_hint(&content)
            }
            None => raw_hint,
        };
        index.observe(sequence, oldest_hint);

        invariants.evaluate(
            &previous,
            &EntryStamp {
                sequence,
                oldest_hint,
            },
            &index.view(),
        )?;
    }

    Ok(index)
}
