// Record Store
//
// Last-writer-wins map of fields. Every field ever written stays live and
// is defined by the last entry that wrote it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{KeyedLog, StoreError};
use crate::log::{LogEntry, LogStore, Sequence, StructureTag};
use crate::replay::Structure;
use crate::squeeze::SqueezePlan;
use crate::state::SequenceIndex;

/// Field name to value.
pub type Record = BTreeMap<String, Value>;

/// Persisted shape of a record entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordContent {
    pub structure: StructureTag,
    #[serde(default)]
    pub oldest: Sequence,
    #[serde(default)]
    pub update: Record,
}

pub struct RecordStructure;

impl Structure for RecordStructure {
    const TAG: StructureTag = StructureTag::Record;
    type Key = String;
    type Content = RecordContent;

    fn oldest_hint(content: &RecordContent) -> Sequence {
        content.oldest
    }

    fn fold(index: &mut SequenceIndex<String>, sequence: Sequence, content: &RecordContent) {
        for field in content.update.keys() {
            index.define(field.clone(), sequence);
        }
    }
}

#[derive(Debug)]
pub struct RecordStore<L: LogStore> {
    pub(super) inner: KeyedLog<L, RecordStructure>,
}

impl<L: LogStore> RecordStore<L> {
    /// Start replaying in the background. See [`RecordStore::loaded`].
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

    /// Fold every record entry, later fields overriding earlier ones.
    pub async fn get(&self) -> Result<Record, StoreError> {
        let mut record = Record::new();
        for (_, content) in self.inner.entries().await? {
            record.extend(content.update);
        }
        Ok(record)
    }

    /// Write `changes` unless every field already holds that value.
    ///
    /// When anything differs the whole of `changes` is written, not just
    /// the differing fields.
    #[instrument(skip(self))]
    pub async fn update(&self, changes: Record) -> Result<bool, StoreError> {
        let mut index = self.inner.lock().await?;
        let current = self.get().await?;
        if changes.iter().all(|(field, value)| current.get(field) == Some(value)) {
            debug!("Update matches current record");
            return Ok(false);
        }
        self.force_update_locked(&mut index, changes).await?;
        Ok(true)
    }

    /// Write `changes` unconditionally.
    #[instrument(skip(self))]
    pub async fn force_update(&self, changes: Record) -> Result<bool, StoreError> {
        let mut index = self.inner.lock().await?;
        self.force_update_locked(&mut index, changes).await?;
        Ok(true)
    }

    async fn force_update_locked(
        &self,
        index: &mut SequenceIndex<String>,
        changes: Record,
    ) -> Result<LogEntry, StoreError> {
        let tentative = index.next_sequence();
        let mut next = index.clone();
        for field in changes.keys() {
            next.define(field.clone(), tentative);
        }
        let oldest = next.min_live().unwrap_or(tentative);
        let defined = changes.keys().cloned().collect();

        let content = RecordContent {
            structure: StructureTag::Record,
            oldest,
            update: changes,
        };
        self.inner.commit(index, next, oldest, content, defined).await
    }

    /// Rewrite every blocking field with its current value, one entry per
    /// field. Returns whether anything was written.
    #[instrument(skip(self))]
    pub async fn squeeze(&self) -> Result<bool, StoreError> {
        let mut index = self.inner.lock().await?;
        let plan = SqueezePlan::of(&*index);
        if plan.is_packed() {
            return Ok(false);
        }

        let record = self.get().await?;
        let mut rewritten = 0;
        for field in plan.blocking {
            let Some(value) = record.get(&field) else {
                warn!(%field, "Blocking field missing from record");
                continue;
            };
            let changes = Record::from([(field, value.clone())]);
            self.force_update_locked(&mut index, changes).await?;
            rewritten += 1;
        }

        info!(rewritten, oldest = index.oldest(), "Squeezed record");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLogStore;
    use crate::testing::FlakyLog;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn changes(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn fresh() -> (Arc<MemoryLogStore>, RecordStore<MemoryLogStore>) {
        let log = Arc::new(MemoryLogStore::new());
        let store = RecordStore::load(Arc::clone(&log)).await.unwrap();
        (log, store)
    }

    #[tokio::test]
    async fn update_scenario() {
        let (_, store) = fresh().await;
        assert_eq!(store.oldest().await.unwrap(), 1);

        assert!(store.update(changes(&[("name", json!("alice"))])).await.unwrap());
        assert_eq!(store.get().await.unwrap(), changes(&[("name", json!("alice"))]));
        assert_eq!(store.oldest().await.unwrap(), 1);

        assert!(store.update(changes(&[("age", json!(20))])).await.unwrap());
        let expected = changes(&[("name", json!("alice")), ("age", json!(20))]);
        assert_eq!(store.get().await.unwrap(), expected);
        assert_eq!(store.oldest().await.unwrap(), 1);

        assert!(!store.update(changes(&[("name", json!("alice"))])).await.unwrap());
        assert_eq!(store.get().await.unwrap(), expected);
        assert_eq!(store.oldest().await.unwrap(), 1);
        assert_eq!(store.latest().await.unwrap(), 2);

        assert!(store.update(changes(&[("name", json!("Alice"))])).await.unwrap());
        assert_eq!(
            store.get().await.unwrap(),
            changes(&[("name", json!("Alice")), ("age", json!(20))])
        );
        assert_eq!(store.oldest().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn squeeze_scenario() {
        let (_, store) = fresh().await;
        store.update(changes(&[("name", json!("alice"))])).await.unwrap();
        store.update(changes(&[("age", json!(20))])).await.unwrap();
        store.update(changes(&[("name", json!("Alice"))])).await.unwrap();
        for age in 21..=23 {
            assert!(store.update(changes(&[("age", json!(age))])).await.unwrap());
        }
        assert_eq!(store.oldest().await.unwrap(), 3);
        assert_eq!(store.squeeze_potential().await.unwrap(), 2);

        let before = store.get().await.unwrap();
        assert!(store.squeeze().await.unwrap());
        assert_eq!(store.get().await.unwrap(), before);
        assert_eq!(store.latest().await.unwrap(), 7);
        assert_eq!(store.oldest().await.unwrap(), 6);
        assert_eq!(store.squeeze_potential().await.unwrap(), 0);

        assert!(!store.squeeze().await.unwrap());
        assert_eq!(store.latest().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn whole_change_map_is_persisted() {
        let (log, store) = fresh().await;
        store
            .update(changes(&[("a", json!(1)), ("b", json!(2))]))
            .await
            .unwrap();
        assert!(store
            .update(changes(&[("a", json!(1)), ("b", json!(3))]))
            .await
            .unwrap());

        let last = log.scan(&|_: &LogEntry| true).await.unwrap().pop().unwrap();
        assert_eq!(
            last.content,
            json!({"structure": "record", "oldest": 2, "update": {"a": 1, "b": 3}})
        );
    }

    #[tokio::test]
    async fn empty_update_is_noop() {
        let (log, store) = fresh().await;
        assert!(!store.update(Record::new()).await.unwrap());
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn force_update_always_appends() {
        let (_, store) = fresh().await;
        store.update(changes(&[("a", json!(1))])).await.unwrap();
        assert!(store.force_update(changes(&[("a", json!(1))])).await.unwrap());
        assert_eq!(store.latest().await.unwrap(), 2);
        assert_eq!(store.oldest().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn shared_slot_fields_squeeze_together() {
        let (_, store) = fresh().await;
        store
            .update(changes(&[("a", json!(1)), ("b", json!(1))]))
            .await
            .unwrap();
        store.update(changes(&[("c", json!(1))])).await.unwrap();
        store.update(changes(&[("c", json!(2))])).await.unwrap();
        store.update(changes(&[("c", json!(3))])).await.unwrap();
        assert_eq!(store.oldest().await.unwrap(), 1);

        assert!(store.squeeze().await.unwrap());
        assert_eq!(store.latest().await.unwrap(), 6);
        assert_eq!(store.oldest().await.unwrap(), 4);
        assert!(store.inner.plan().await.unwrap().is_packed());
    }

    #[tokio::test]
    async fn squeeze_interrupted_by_failed_append() {
        let log = Arc::new(FlakyLog::new());
        let store = RecordStore::load(Arc::clone(&log)).await.unwrap();
        store.update(changes(&[("a", json!(1))])).await.unwrap();
        store.update(changes(&[("c", json!(1))])).await.unwrap();
        store.update(changes(&[("b", json!(1))])).await.unwrap();
        store.update(changes(&[("c", json!(2))])).await.unwrap();
        store.update(changes(&[("c", json!(3))])).await.unwrap();
        let before = store.get().await.unwrap();

        // a@1 and b@3 both block; only the rewrite of "a" lands.
        log.fail_append_after(1);
        assert!(matches!(store.squeeze().await, Err(StoreError::Append(_))));
        assert_eq!(store.latest().await.unwrap(), 6);
        assert_eq!(store.oldest().await.unwrap(), 3);
        assert_eq!(store.get().await.unwrap(), before);

        let reloaded = RecordStore::load(Arc::clone(&log)).await.unwrap();
        assert_eq!(
            reloaded.inner.snapshot().await.unwrap(),
            store.inner.snapshot().await.unwrap()
        );

        assert!(store.squeeze().await.unwrap());
        assert_eq!(store.latest().await.unwrap(), 7);
        assert_eq!(store.oldest().await.unwrap(), 5);
        assert_eq!(store.get().await.unwrap(), before);
        assert!(store.inner.plan().await.unwrap().is_packed());
    }

    #[tokio::test]
    async fn random_updates_match_reference_fold() {
        let keys = ["a", "b", "c", "d"];

        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (log, store) = fresh().await;
            let mut model = Record::new();
            let mut oldest = store.oldest().await.unwrap();

            for _ in 0..40 {
                if rng.random_bool(0.2) {
                    let before = store.get().await.unwrap();
                    store.squeeze().await.unwrap();
                    assert_eq!(store.get().await.unwrap(), before);
                } else {
                    let mut batch = Record::new();
                    for _ in 0..rng.random_range(1..=2) {
                        let key = keys[rng.random_range(0..keys.len())];
                        batch.insert(key.to_string(), json!(rng.random_range(0..3)));
                    }
                    let differs = batch.iter().any(|(k, v)| model.get(k) != Some(v));
                    assert_eq!(store.update(batch.clone()).await.unwrap(), differs);
                    model.extend(batch);
                }

                assert_eq!(store.get().await.unwrap(), model);
                let now = store.oldest().await.unwrap();
                assert!(now >= oldest, "oldest went from {oldest} to {now}");
                oldest = now;
            }

            let mut rounds = 0;
            while store.squeeze().await.unwrap() {
                rounds += 1;
                assert!(rounds < 16, "squeeze did not converge");
            }
            assert!(store.inner.plan().await.unwrap().is_packed());
            assert!(!store.squeeze().await.unwrap());
            assert_eq!(store.get().await.unwrap(), model);

            let reloaded = RecordStore::load(log).await.unwrap();
            assert_eq!(
                reloaded.inner.snapshot().await.unwrap(),
                store.inner.snapshot().await.unwrap()
            );
        }
    }
}
