// Sequence Index
//
// In-memory bookkeeping of the scan window for one keyed structure:
// the oldest sequence a reader must start from, the latest own sequence,
// and the sequence that last defined each live key.

use std::collections::BTreeMap;

use crate::log::Sequence;

/// Window bookkeeping for a keyed structure.
///
/// Cloning is how callers snapshot before an append: mutate the clone,
/// swap it in only once the log accepts the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceIndex<K: Ord> {
    oldest: Sequence,
    latest: Sequence,
    last_seq_of: BTreeMap<K, Sequence>,
}

/// Key-free summary of an index, used by invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowView {
    pub oldest: Sequence,
    pub latest: Sequence,
    pub live: usize,
    pub live_min: Option<Sequence>,
    pub live_max: Option<Sequence>,
}

impl<K: Ord> Default for SequenceIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord> SequenceIndex<K> {
    pub fn new() -> Self {
        Self {
            oldest: 1,
            latest: 0,
            last_seq_of: BTreeMap::new(),
        }
    }

    pub fn oldest(&self) -> Sequence {
        self.oldest
    }

    pub fn latest(&self) -> Sequence {
        self.latest
    }

    /// Sequence the next own entry receives when no foreign traffic
    /// interleaves.
    pub fn next_sequence(&self) -> Sequence {
        self.latest + 1
    }

    pub fn live_len(&self) -> usize {
        self.last_seq_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seq_of.is_empty()
    }

    pub fn sequence_of(&self, key: &K) -> Option<Sequence> {
        self.last_seq_of.get(key).copied()
    }

    pub fn live(&self) -> impl Iterator<Item = (&K, Sequence)> + '_ {
        self.last_seq_of.iter().map(|(k, s)| (k, *s))
    }

    /// Live keys whose defining entry sits at `sequence`.
    pub fn keys_at(&self, sequence: Sequence) -> impl Iterator<Item = &K> + '_ {
        self.last_seq_of
            .iter()
            .filter(move |(_, s)| **s == sequence)
            .map(|(k, _)| k)
    }

    pub fn min_live(&self) -> Option<Sequence> {
        self.last_seq_of.values().copied().min()
    }

    pub fn define(&mut self, key: K, sequence: Sequence) {
        self.last_seq_of.insert(key, sequence);
    }

    /// Drop `key` from the live set, returning where it was defined.
    pub fn retire(&mut self, key: &K) -> Option<Sequence> {
        self.last_seq_of.remove(key)
    }

    /// Fold one own entry seen during replay.
    pub fn observe(&mut self, sequence: Sequence, oldest_hint: Sequence) {
        self.oldest = self.oldest.max(oldest_hint).max(1);
        self.latest = self.latest.max(sequence);
    }

    /// Commit a successful append.
    pub fn advance(&mut self, sequence: Sequence, oldest: Sequence) {
        self.latest = sequence;
        self.oldest = oldest;
    }

    /// Slots in `[oldest, latest]` not occupied by a live key.
    ///
    /// Keys written by the same entry share a slot, so this can go
    /// negative for records.
    pub fn squeeze_potential(&self) -> i64 {
        let slots = self.latest as i64 - self.oldest as i64 + 1;
        slots - self.last_seq_of.len() as i64
    }

    pub fn view(&self) -> WindowView {
        WindowView {
            oldest: self.oldest,
            latest: self.latest,
            live: self.last_seq_of.len(),
            live_min: self.min_live(),
            live_max: self.last_seq_of.values().copied().max(),
        }
    }
}
