//! Chunked, duplicate-safe ingestion into the record collections.
//!
//! Partially written chunks are acceptable: every write here is keyed by
//! `tx.h`, so re-running the same block through [`Ingestor::replace_range`]
//! converges on the same stored set.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::IndexerError;
use crate::store::{Collection, DocumentStore, IndexConfig, InsertOutcome};
use crate::types::Document;

/// Documents per insert-many call.
pub const CHUNK_SIZE: usize = 1000;

/// Writes record batches into a [`DocumentStore`].
pub struct Ingestor {
    store: Arc<dyn DocumentStore>,
    chunk_size: usize,
}

impl Ingestor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_chunk_size(store, CHUNK_SIZE)
    }

    pub fn with_chunk_size(store: Arc<dyn DocumentStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// The underlying backend.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    // ─── Confirmed ────────────────────────────────────────────────────────────

    /// Append the records of block `height` to the confirmed collection.
    pub async fn append(&self, docs: &[Document], height: u64) -> Result<InsertOutcome, IndexerError> {
        let outcome = self.insert_chunked(Collection::Confirmed, docs).await?;
        info!(
            height,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "block inserted"
        );
        Ok(outcome)
    }

    /// Delete every confirmed record at `from_height` or above, then append
    /// `docs` at that height.
    ///
    /// The delete completes before the first insert is issued.
    pub async fn replace_range(
        &self,
        docs: &[Document],
        from_height: u64,
    ) -> Result<InsertOutcome, IndexerError> {
        info!(from_height, "deleting confirmed records at or above height");
        let deleted = self
            .store
            .delete_from_height(Collection::Confirmed, from_height)
            .await?;
        info!(from_height, deleted, records = docs.len(), "replacing block");
        self.append(docs, from_height).await
    }

    /// Delete every confirmed record.
    pub async fn reset_confirmed(&self) -> Result<u64, IndexerError> {
        let deleted = self.store.delete_all(Collection::Confirmed).await?;
        info!(deleted, "confirmed collection cleared");
        Ok(deleted)
    }

    // ─── Unconfirmed ──────────────────────────────────────────────────────────

    /// Insert one mempool record. Returns `false` if it was already stored.
    pub async fn append_mempool(&self, doc: &Document) -> Result<bool, IndexerError> {
        let outcome = self
            .store
            .insert_many(Collection::Unconfirmed, std::slice::from_ref(doc))
            .await?;
        Ok(outcome.inserted == 1)
    }

    /// Replace the whole unconfirmed collection with `docs`.
    pub async fn replace_mempool(&self, docs: &[Document]) -> Result<InsertOutcome, IndexerError> {
        self.store.delete_all(Collection::Unconfirmed).await?;
        let outcome = self.insert_chunked(Collection::Unconfirmed, docs).await?;
        info!(
            items = outcome.inserted,
            duplicates = outcome.duplicates,
            "mempool synchronized"
        );
        Ok(outcome)
    }

    /// Delete every unconfirmed record.
    pub async fn reset_mempool(&self) -> Result<u64, IndexerError> {
        let deleted = self.store.delete_all(Collection::Unconfirmed).await?;
        info!(deleted, "unconfirmed collection cleared");
        Ok(deleted)
    }

    // ─── Indexes ──────────────────────────────────────────────────────────────

    /// Create the configured indexes on both collections.
    pub async fn ensure_indexes(&self, config: &IndexConfig) -> Result<(), IndexerError> {
        for collection in Collection::ALL {
            let spec = config.for_collection(collection);
            info!(
                %collection,
                keys = spec.keys.len(),
                fulltext = spec.fulltext.len(),
                "creating indexes"
            );
            self.store.create_indexes(collection, spec).await?;
        }
        Ok(())
    }

    async fn insert_chunked(
        &self,
        collection: Collection,
        docs: &[Document],
    ) -> Result<InsertOutcome, IndexerError> {
        let mut total = InsertOutcome::default();
        for (index, chunk) in docs.chunks(self.chunk_size).enumerate() {
            let outcome = self.store.insert_many(collection, chunk).await?;
            if outcome.duplicates > 0 {
                debug!(%collection, duplicates = outcome.duplicates, "duplicate records ignored");
            }
            debug!(%collection, chunk = index, size = chunk.len(), "chunk processed");
            total.merge(outcome);
        }
        Ok(total)
    }
}
