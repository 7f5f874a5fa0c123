// Set Store
//
// Add/remove membership set. Only present items are live; each is
// defined by the entry that (re-)added it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{KeyedLog, StoreError};
use crate::log::{LogEntry, LogStore, Sequence, StructureTag};
use crate::replay::Structure;
use crate::squeeze::SqueezePlan;
use crate::state::SequenceIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetOp {
    Add(String),
    Remove(String),
}

impl SetOp {
    pub fn item(&self) -> &str {
        match self {
            SetOp::Add(item) | SetOp::Remove(item) => item,
        }
    }
}

/// Persisted shape of a set entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetContent {
    pub structure: StructureTag,
    #[serde(default)]
    pub oldest: Sequence,
    #[serde(flatten)]
    pub op: SetOp,
}

pub struct SetStructure;

impl Structure for SetStructure {
    const TAG: StructureTag = StructureTag::Set;
    type Key = String;
    type Content = SetContent;

    fn oldest_hint(content: &SetContent) -> Sequence {
        content.oldest
    }

    fn fold(index: &mut SequenceIndex<String>, sequence: Sequence, content: &SetContent) {
        match &content.op {
            SetOp::Add(item) => index.define(item.clone(), sequence),
            SetOp::Remove(item) => {
                index.retire(item);
            }
        }
    }
}

/// Oldest hint after `next` has lost the key that sat at `removed`.
///
/// Dropping the oldest-referenced key lets the hint jump to the next
/// survivor; dropping any other key leaves it where it was.
fn oldest_after_retire(
    next: &SequenceIndex<String>,
    removed: Option<Sequence>,
    oldest: Sequence,
    tentative: Sequence,
) -> Sequence {
    match next.min_live() {
        None => tentative,
        Some(min) if removed.is_some_and(|seq| seq < min) => min,
        Some(_) => oldest,
    }
}

#[derive(Debug)]
pub struct SetStore<L: LogStore> {
    pub(super) inner: KeyedLog<L, SetStructure>,
}

impl<L: LogStore> SetStore<L> {
    /// Start replaying in the background. See [`SetStore::loaded`].
    pub fn open(log: Arc<L>) -> Self {
        Self {
            inner: KeyedLog::open(log),
        }
    }

    /// Open and wait for replay to finish.
    pub async fn load(log: Arc<L>) -> Result<Self, StoreError> {
        let store = Self::open(log);
        store.loaded().await?;
        Ok(store)
    }

    pub async fn loaded(&self) -> Result<(), StoreError> {
        self.inner.loaded().await
    }

    /// True iff the latest entry naming `item` added it.
    pub async fn has(&self, item: &str) -> Result<bool, StoreError> {
        let mut found = false;
        for (_, content) in self.inner.entries().await? {
            if content.op.item() == item {
                found = matches!(content.op, SetOp::Add(_));
            }
        }
        Ok(found)
    }

    /// Present items in the order they (last) became present.
    pub async fn values(&self) -> Result<Vec<String>, StoreError> {
        let mut present: Vec<String> = Vec::new();
        for (_, content) in self.inner.entries().await? {
            match content.op {
                SetOp::Add(item) => {
                    if !present.contains(&item) {
                        present.push(item);
                    }
                }
                SetOp::Remove(item) => present.retain(|p| *p != item),
            }
        }
        Ok(present)
    }

    #[instrument(skip(self))]
    pub async fn add(&self, item: &str) -> Result<bool, StoreError> {
        let mut index = self.inner.lock().await?;
        if self.has(item).await? {
            debug!("Already present");
            return Ok(false);
        }

        let tentative = index.next_sequence();
        // A first item anchors the window; otherwise adding cannot move it.
        let oldest = if index.is_empty() {
            tentative
        } else {
            index.oldest()
        };
        let mut next = index.clone();
        next.define(item.to_string(), tentative);

        let content = SetContent {
            structure: StructureTag::Set,
            oldest,
            op: SetOp::Add(item.to_string()),
        };
        self.inner
            .commit(&mut index, next, oldest, content, vec![item.to_string()])
            .await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn del(&self, item: &str) -> Result<bool, StoreError> {
        let mut index = self.inner.lock().await?;
        if !self.has(item).await? {
            debug!("Already absent");
            return Ok(false);
        }

        let tentative = index.next_sequence();
        let mut next = index.clone();
        let removed = next.retire(&item.to_string());
        let oldest = oldest_after_retire(&next, removed, index.oldest(), tentative);

        let content = SetContent {
            structure: StructureTag::Set,
            oldest,
            op: SetOp::Remove(item.to_string()),
        };
        self.inner
            .commit(&mut index, next, oldest, content, Vec::new())
            .await?;
        Ok(true)
    }

    /// Re-add a present item at a fresh sequence, retiring its old slot.
    async fn readd_locked(
        &self,
        index: &mut SequenceIndex<String>,
        item: String,
    ) -> Result<LogEntry, StoreError> {
        let tentative = index.next_sequence();
        let mut next = index.clone();
        let removed = next.retire(&item);
        let oldest = oldest_after_retire(&next, removed, index.oldest(), tentative);
        next.define(item.clone(), tentative);

        let content = SetContent {
            structure: StructureTag::Set,
            oldest,
            op: SetOp::Add(item.clone()),
        };
        self.inner
            .commit(index, next, oldest, content, vec![item])
            .await
    }

    /// Re-add every blocking item. Returns whether anything was written.
    #[instrument(skip(self))]
    pub async fn squeeze(&self) -> Result<bool, StoreError> {
        let mut index = self.inner.lock().await?;
        let plan = SqueezePlan::of(&*index);
        if plan.is_packed() {
            return Ok(false);
        }

        let mut rewritten = 0;
        for item in plan.blocking {
            self.readd_locked(&mut index, item).await?;
            rewritten += 1;
        }

        info!(rewritten, oldest = index.oldest(), "Squeezed set");
        Ok(rewritten > 0)
    }

    pub async fn oldest(&self) -> Result<Sequence, StoreError> {
        self.inner.oldest().await
    }

    pub async fn latest(&self) -> Result<Sequence, StoreError> {
        self.inner.latest().await
    }

    pub async fn squeeze_potential(&self) -> Result<i64, StoreError> {
        self.inner.squeeze_potential().await
    }
}
