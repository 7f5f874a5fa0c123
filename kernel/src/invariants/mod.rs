// Invariant Framework
//
// Invariants are pure rules over scan-window transitions. They run on
// every entry during replay and on every planned append, so a violation
// is caught before a bad hint reaches the log.

use crate::log::Sequence;
use crate::state::WindowView;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// The entry driving a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStamp {
    pub sequence: Sequence,
    pub oldest_hint: Sequence,
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(
        &self,
        previous: &WindowView,
        entry: &EntryStamp,
        next: &WindowView,
    ) -> InvariantResult;
}

/// A hint may never point past the entry carrying it.
pub struct HintWithinEntry;

impl Invariant for HintWithinEntry {
    fn name(&self) -> &'static str {
        "hint-within-entry"
    }

    fn validate(&self, _: &WindowView, entry: &EntryStamp, _: &WindowView) -> InvariantResult {
        if entry.oldest_hint > entry.sequence {
            InvariantResult::Fail(format!(
                "hint {} is past sequence {}",
                entry.oldest_hint, entry.sequence
            ))
        } else {
            InvariantResult::Pass
        }
    }
}

pub struct SequenceAdvances;

impl Invariant for SequenceAdvances {
    fn name(&self) -> &'static str {
        "sequence-advances"
    }

    fn validate(
        &self,
        previous: &WindowView,
        entry: &EntryStamp,
        _: &WindowView,
    ) -> InvariantResult {
        if entry.sequence <= previous.latest {
            InvariantResult::Fail(format!(
                "sequence {} does not follow {}",
                entry.sequence, previous.latest
            ))
        } else {
            InvariantResult::Pass
        }
    }
}

pub struct OldestNeverRegresses;

impl Invariant for OldestNeverRegresses {
    fn name(&self) -> &'static str {
        "oldest-never-regresses"
    }

    fn validate(&self, previous: &WindowView, _: &EntryStamp, next: &WindowView) -> InvariantResult {
        if next.oldest < previous.oldest {
            InvariantResult::Fail(format!(
                "oldest would move back from {} to {}",
                previous.oldest, next.oldest
            ))
        } else {
            InvariantResult::Pass
        }
    }
}

/// Skipping everything before `oldest` must never hide a live key.
pub struct LiveWithinWindow;

impl Invariant for LiveWithinWindow {
    fn name(&self) -> &'static str {
        "live-within-window"
    }

    fn validate(&self, _: &WindowView, _: &EntryStamp, next: &WindowView) -> InvariantResult {
        match (next.live_min, next.live_max) {
            (Some(min), _) if min < next.oldest => InvariantResult::Fail(format!(
                "live key at {} precedes oldest {}",
                min, next.oldest
            )),
            (_, Some(max)) if max > next.latest => InvariantResult::Fail(format!(
                "live key at {} follows latest {}",
                max, next.latest
            )),
            _ => InvariantResult::Pass,
        }
    }
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Create a new invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with every window invariant registered.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(HintWithinEntry);
        engine.register(SequenceAdvances);
        engine.register(OldestNeverRegresses);
        engine.register(LiveWithinWindow);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: &WindowView,
        entry: &EntryStamp,
        next: &WindowView,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, entry, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.invariants.iter().map(|i| i.name()).collect();
        f.debug_struct("InvariantEngine").field("invariants", &names).finish()
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}
