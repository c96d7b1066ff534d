//! In-memory storage backend.
//!
//! Stores both record collections and checkpoints in RAM.
//! Useful for testing and short-lived crawls that don't need persistence.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use bitsync_core::checkpoint::{Checkpoint, CheckpointStore};
use bitsync_core::error::IndexerError;
use bitsync_core::store::{Collection, DocumentStore, IndexSpec, InsertOutcome};
use bitsync_core::types::{document_hash, document_height, Document};

/// One collection: documents in insertion order plus the unique hash set.
#[derive(Default)]
struct Records {
    docs: Vec<Document>,
    hashes: HashSet<String>,
}

impl Records {
    fn retain(&mut self, keep: impl Fn(&Document) -> bool) -> u64 {
        let before = self.docs.len();
        self.docs.retain(|d| keep(d));
        let hashes = self
            .docs
            .iter()
            .filter_map(document_hash)
            .map(str::to_string)
            .collect();
        self.hashes = hashes;
        (before - self.docs.len()) as u64
    }
}

/// In-memory indexer storage.
///
/// All data is lost when the process exits. Index specs are recorded but not
/// materialized.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    records: Mutex<HashMap<Collection, Records>>,
    indexes: Mutex<HashMap<Collection, IndexSpec>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every document in a collection, in insertion order.
    pub fn documents(&self, collection: Collection) -> Vec<Document> {
        self.records
            .lock()
            .unwrap()
            .get(&collection)
            .map(|r| r.docs.clone())
            .unwrap_or_default()
    }

    /// The last index spec applied to a collection.
    pub fn index_spec(&self, collection: Collection) -> Option<IndexSpec> {
        self.indexes.lock().unwrap().get(&collection).cloned()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStorage {
    async fn insert_many(
        &self,
        collection: Collection,
        docs: &[Document],
    ) -> Result<InsertOutcome, IndexerError> {
        let mut records = self.records.lock().unwrap();
        let records = records.entry(collection).or_default();
        let mut outcome = InsertOutcome::default();
        for doc in docs {
            let hash = document_hash(doc)
                .ok_or_else(|| IndexerError::Storage("document has no tx.h".into()))?;
            if records.hashes.insert(hash.to_string()) {
                records.docs.push(doc.clone());
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        Ok(outcome)
    }

    async fn delete_from_height(&self, collection: Collection, height: u64) -> Result<u64, IndexerError> {
        let mut records = self.records.lock().unwrap();
        Ok(records
            .entry(collection)
            .or_default()
            .retain(|d| document_height(d).map_or(true, |h| h < height)))
    }

    async fn delete_all(&self, collection: Collection) -> Result<u64, IndexerError> {
        let removed = self.records.lock().unwrap().remove(&collection);
        Ok(removed.map_or(0, |r| r.docs.len() as u64))
    }

    async fn count(&self, collection: Collection) -> Result<u64, IndexerError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&collection)
            .map_or(0, |r| r.docs.len() as u64))
    }

    async fn find_by_hash(
        &self,
        collection: Collection,
        hash: &str,
    ) -> Result<Option<Document>, IndexerError> {
        Ok(self.records.lock().unwrap().get(&collection).and_then(|r| {
            r.docs
                .iter()
                .find(|d| document_hash(d) == Some(hash))
                .cloned()
        }))
    }

    async fn hashes(&self, collection: Collection) -> Result<Vec<String>, IndexerError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&collection)
            .map(|r| {
                r.docs
                    .iter()
                    .filter_map(document_hash)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_indexes(&self, collection: Collection, spec: &IndexSpec) -> Result<(), IndexerError> {
        self.indexes.lock().unwrap().insert(collection, spec.clone());
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, indexer_id: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.checkpoints.lock().unwrap().get(indexer_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.indexer_id.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, indexer_id: &str) -> Result<(), IndexerError> {
        self.checkpoints.lock().unwrap().remove(indexer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitsync_core::ingest::Ingestor;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(h: &str, height: u64) -> Document {
        json!({ "tx": { "h": h }, "blk": { "i": height, "h": "00", "t": 0 }, "out": [] })
    }

    fn mempool(h: &str) -> Document {
        json!({ "tx": { "h": h }, "out": [] })
    }

    #[tokio::test]
    async fn idempotent_append() {
        let store = Arc::new(InMemoryStorage::new());
        let ing = Ingestor::new(store.clone());
        let batch = vec![doc("a", 1), doc("b", 1)];

        let first = ing.append(&batch, 1).await.unwrap();
        let second = ing.append(&batch, 1).await.unwrap();
        assert_eq!(first, InsertOutcome { inserted: 2, duplicates: 0 });
        assert_eq!(second, InsertOutcome { inserted: 0, duplicates: 2 });
        assert_eq!(store.documents(Collection::Confirmed), batch);

        assert!(ing.append_mempool(&mempool("m")).await.unwrap());
        assert!(!ing.append_mempool(&mempool("m")).await.unwrap());
        assert_eq!(store.count(Collection::Unconfirmed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn range_replace() {
        let store = Arc::new(InMemoryStorage::new());
        let ing = Ingestor::new(store.clone());
        ing.append(&[doc("a10", 10)], 10).await.unwrap();
        ing.append(&[doc("a11", 11), doc("b11", 11)], 11).await.unwrap();
        ing.append(&[doc("a12", 12)], 12).await.unwrap();

        ing.replace_range(&[doc("n11", 11)], 11).await.unwrap();
        assert_eq!(
            store.hashes(Collection::Confirmed).await.unwrap(),
            vec!["a10", "n11"]
        );
        // the removed hashes are free to be inserted again
        ing.append(&[doc("a12", 12)], 12).await.unwrap();
        assert_eq!(store.count(Collection::Confirmed).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mempool_full_resync() {
        let store = Arc::new(InMemoryStorage::new());
        let ing = Ingestor::new(store.clone());
        ing.replace_mempool(&[mempool("a"), mempool("b"), mempool("c")])
            .await
            .unwrap();
        ing.replace_mempool(&[mempool("d"), mempool("e")]).await.unwrap();
        assert_eq!(store.hashes(Collection::Unconfirmed).await.unwrap(), vec!["d", "e"]);
        assert!(store
            .find_by_hash(Collection::Unconfirmed, "a")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn missing_hash_rejected() {
        let store = InMemoryStorage::new();
        let err = store
            .insert_many(Collection::Confirmed, &[json!({ "out": [] })])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
    }

    #[tokio::test]
    async fn collections_are_separate() {
        let store = InMemoryStorage::new();
        store.insert_many(Collection::Confirmed, &[doc("x", 5)]).await.unwrap();
        store.insert_many(Collection::Unconfirmed, &[mempool("x")]).await.unwrap();
        assert_eq!(store.delete_all(Collection::Unconfirmed).await.unwrap(), 1);
        assert_eq!(store.count(Collection::Confirmed).await.unwrap(), 1);

        let spec = IndexSpec { keys: vec!["blk.i".into()], fulltext: vec![] };
        store.create_indexes(Collection::Confirmed, &spec).await.unwrap();
        assert_eq!(store.index_spec(Collection::Confirmed), Some(spec));
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = InMemoryStorage::new();
        let cp = Checkpoint {
            indexer_id: "tip".into(),
            block_number: 1000,
            updated_at: 0,
        };
        store.save(cp).await.unwrap();
        let loaded = store.load("tip").await.unwrap().unwrap();
        assert_eq!(loaded.block_number, 1000);
        store.delete("tip").await.unwrap();
        assert!(store.load("tip").await.unwrap().is_none());
    }
}
