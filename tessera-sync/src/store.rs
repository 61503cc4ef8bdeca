//! Authoritative in-memory record store.
//!
//! An ordered `Vec<Record>` behind a `tokio::sync::Mutex`. Each of
//! `add` / `set` / `delete` takes the lock once, so mutations are
//! linearizable and `list()` never observes a half-applied change.
//!
//! [`RecordStore::lock`] hands out the guard itself for callers that must
//! pair a mutation with follow-up work (the session handler enqueues the
//! resulting notification before releasing it).

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::protocol::Record;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Mutation target is absent. Expected for stale clients.
    #[error("Record not found: {0}")]
    NotFound(Uuid),
}

/// Ordered record collection, unique by id.
pub struct RecordStore {
    records: Mutex<Vec<Record>>,
}

impl RecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Create a store holding one fresh record per seed text, in order.
    pub fn seeded<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = texts
            .into_iter()
            .map(|text| Record::new(Uuid::new_v4(), text))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    /// Acquire exclusive access.
    pub async fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            records: self.records.lock().await,
        }
    }

    pub async fn list(&self) -> Vec<Record> {
        self.lock().await.list()
    }

    pub async fn get(&self, id: Uuid) -> Option<Record> {
        self.lock().await.get(id).cloned()
    }

    pub async fn add(&self, text: impl Into<String>) -> Record {
        self.lock().await.add(text)
    }

    pub async fn set(&self, id: Uuid, text: impl Into<String>) -> Result<Record, StoreError> {
        self.lock().await.set(id, text)
    }

    pub async fn delete(&self, id: Uuid) -> Result<Record, StoreError> {
        self.lock().await.delete(id)
    }

    pub async fn len(&self) -> usize {
        self.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lock().await.is_empty()
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive view of the store. Dropping it releases the lock.
pub struct StoreGuard<'a> {
    records: MutexGuard<'a, Vec<Record>>,
}

impl StoreGuard<'_> {
    /// Full contents in stored order.
    pub fn list(&self) -> Vec<Record> {
        self.records.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Append a record with a fresh id.
    pub fn add(&mut self, text: impl Into<String>) -> Record {
        let mut id = Uuid::new_v4();
        // Ids stay unique even across a v4 collision.
        while self.position(id).is_some() {
            id = Uuid::new_v4();
        }
        let record = Record::new(id, text);
        self.records.push(record.clone());
        record
    }

    /// Replace the text at `id`, keeping its position.
    pub fn set(&mut self, id: Uuid, text: impl Into<String>) -> Result<Record, StoreError> {
        let index = self.position(id).ok_or(StoreError::NotFound(id))?;
        let record = Record::new(id, text);
        self.records[index] = record.clone();
        Ok(record)
    }

    /// Remove `id`, returning the removed value.
    pub fn delete(&mut self, id: Uuid) -> Result<Record, StoreError> {
        let index = self.position(id).ok_or(StoreError::NotFound(id))?;
        Ok(self.records.remove(index))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn assert_unique(records: &[Record]) {
        let ids: HashSet<Uuid> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), records.len(), "duplicate id in {records:?}");
    }

    #[tokio::test]
    async fn test_seeded_order() {
        let store = RecordStore::seeded(["Item 1", "Item 2", "Item 3"]);
        let texts: Vec<String> = store.list().await.into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["Item 1", "Item 2", "Item 3"]);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_add_appends() {
        let store = RecordStore::seeded(["a"]);
        let added = store.add("b").await;

        let list = store.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[1], added);
        assert_eq!(added.text, "b");
        assert_eq!(store.get(added.id).await, Some(added));
    }

    #[tokio::test]
    async fn test_set_keeps_position() {
        let store = RecordStore::seeded(["A", "B", "C"]);
        let before = store.list().await;

        let updated = store.set(before[1].id, "x").await.unwrap();
        assert_eq!(updated.id, before[1].id);
        assert_eq!(updated.text, "x");

        let after = store.list().await;
        assert_eq!(after[0], before[0]);
        assert_eq!(after[1], updated);
        assert_eq!(after[2], before[2]);
    }

    #[tokio::test]
    async fn test_delete_keeps_remaining_order() {
        let store = RecordStore::seeded(["A", "B", "C"]);
        let before = store.list().await;

        let removed = store.delete(before[1].id).await.unwrap();
        assert_eq!(removed, before[1]);

        let after = store.list().await;
        assert_eq!(after, vec![before[0].clone(), before[2].clone()]);
    }

    #[tokio::test]
    async fn test_absent_id_leaves_store_unchanged() {
        let store = RecordStore::seeded(["A", "B"]);
        let before = store.list().await;
        let missing = Uuid::new_v4();

        assert_eq!(store.set(missing, "x").await, Err(StoreError::NotFound(missing)));
        assert_eq!(store.delete(missing).await, Err(StoreError::NotFound(missing)));
        assert_eq!(store.list().await, before);
    }

    #[tokio::test]
    async fn test_delete_then_update_is_not_found() {
        let store = RecordStore::seeded(["a"]);
        let id = store.list().await[0].id;
        store.delete(id).await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(store.set(id, "z").await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_mixed_sequence_stays_unique() {
        let store = RecordStore::new();
        let mut ids = Vec::new();
        for i in 0..50 {
            let r = store.add(format!("r{i}")).await;
            ids.push(r.id);
            if i % 3 == 0 {
                let _ = store.set(ids[i / 2], format!("s{i}")).await;
            }
            if i % 5 == 0 {
                let _ = store.delete(ids[i / 3]).await;
            }
            assert_unique(&store.list().await);
        }
    }

    #[tokio::test]
    async fn test_concurrent_mutations_stay_unique() {
        let store = Arc::new(RecordStore::seeded(["seed"]));
        let seed_id = store.list().await[0].id;

        let mut tasks = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    let r = store.add(format!("t{t}-{i}")).await;
                    let _ = store.set(seed_id, format!("t{t}")).await;
                    if i % 2 == 0 {
                        store.delete(r.id).await.unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let list = store.list().await;
        assert_unique(&list);
        // 8 tasks × 25 adds, half deleted, plus the seed.
        assert_eq!(list.len(), 8 * 12 + 1);
        assert_eq!(list[0].id, seed_id);
    }

    #[tokio::test]
    async fn test_guard_batches_under_one_lock() {
        let store = RecordStore::new();
        {
            let mut guard = store.lock().await;
            let a = guard.add("a");
            guard.set(a.id, "a2").unwrap();
            assert_eq!(guard.get(a.id).map(|r| r.text.as_str()), Some("a2"));
            assert_eq!(guard.len(), 1);
        }
        assert_eq!(store.list().await[0].text, "a2");
    }
}
