// Squeeze Planner
//
// Decides which live keys block the oldest hint from advancing. The log
// is never truncated; a blocking key is re-asserted at a fresh sequence so
// its old slot becomes skippable.

use crate::log::Sequence;
use crate::state::SequenceIndex;

/// Outcome of inspecting a window for gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqueezePlan<K> {
    /// Distance from each sorted live sequence (and `latest`) to its
    /// predecessor. The first predecessor is `oldest`.
    pub gaps: Vec<i64>,

    /// Keys to re-assert, in ascending order of their current sequence.
    pub blocking: Vec<K>,
}

impl<K: Ord + Clone> SqueezePlan<K> {
    /// Plan for `index` as it stands.
    ///
    /// Re-asserting `blocking` reaches a packed window only when the first
    /// live key sits at `oldest`. A gap in front of it (foreign traffic
    /// before the structure's first entry) leaves the plan unpacked with
    /// nothing to re-assert.
    pub fn of(index: &SequenceIndex<K>) -> Self {
        let mut seqs: Vec<Sequence> = index.live().map(|(_, s)| s).collect();
        seqs.push(index.latest());
        seqs.sort_unstable();

        let gaps: Vec<i64> = seqs
            .iter()
            .enumerate()
            .map(|(i, seq)| {
                let prev = if i == 0 { index.oldest() } else { seqs[i - 1] };
                *seq as i64 - prev as i64
            })
            .collect();

        // The gap in front of the first live key has no key to blame.
        let mut blocking = Vec::new();
        for i in 1..seqs.len() {
            if gaps[i] >= 2 {
                blocking.extend(index.keys_at(seqs[i - 1]).cloned());
            }
        }

        Self { gaps, blocking }
    }
}

impl<K> SqueezePlan<K> {
    pub fn largest_gap(&self) -> i64 {
        self.gaps.iter().copied().max().unwrap_or(0)
    }

    /// Every slot in the window is accounted for.
    pub fn is_packed(&self) -> bool {
        self.largest_gap() <= 1
    }
}
