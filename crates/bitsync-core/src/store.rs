//! Document store contract.
//!
//! Backends expose primitive collection operations; the chunking and ordering
//! protocol on top of them lives in [`crate::ingest`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::Document;

/// The two logical record collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Transactions from mined blocks.
    Confirmed,
    /// The current mempool snapshot.
    Unconfirmed,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Confirmed, Collection::Unconfirmed];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Unconfirmed => "unconfirmed",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of an insert-many call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Documents written.
    pub inserted: usize,
    /// Documents skipped because their `tx.h` was already present.
    pub duplicates: usize,
}

impl InsertOutcome {
    pub fn merge(&mut self, other: InsertOutcome) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
    }
}

/// Field and full-text indexes for one collection.
///
/// The unique index on `tx.h` is always present and need not be listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSpec {
    /// Dotted paths to index (e.g. `"blk.i"`, `"out.e.a"`).
    pub keys: Vec<String>,
    /// Dotted paths included in the full-text index.
    pub fulltext: Vec<String>,
}

impl IndexSpec {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.fulltext.is_empty()
    }
}

/// Index specs for both collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub confirmed: IndexSpec,
    pub unconfirmed: IndexSpec,
}

impl IndexConfig {
    pub fn for_collection(&self, collection: Collection) -> &IndexSpec {
        match collection {
            Collection::Confirmed => &self.confirmed,
            Collection::Unconfirmed => &self.unconfirmed,
        }
    }
}

/// Storage backend for record documents.
///
/// Every document must carry `tx.h`; a document whose hash is already stored
/// is counted in [`InsertOutcome::duplicates`] and never raises an error.
/// Any `Err` returned from these methods is fatal to the caller.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert documents, skipping duplicates by `tx.h`.
    async fn insert_many(
        &self,
        collection: Collection,
        docs: &[Document],
    ) -> Result<InsertOutcome, IndexerError>;

    /// Delete every document whose `blk.i` is `>= height`. Returns the count.
    async fn delete_from_height(&self, collection: Collection, height: u64) -> Result<u64, IndexerError>;

    /// Delete every document. Returns the count.
    async fn delete_all(&self, collection: Collection) -> Result<u64, IndexerError>;

    /// Number of stored documents.
    async fn count(&self, collection: Collection) -> Result<u64, IndexerError>;

    /// Fetch a document by transaction hash.
    async fn find_by_hash(
        &self,
        collection: Collection,
        hash: &str,
    ) -> Result<Option<Document>, IndexerError>;

    /// All stored transaction hashes, in insertion order.
    async fn hashes(&self, collection: Collection) -> Result<Vec<String>, IndexerError>;

    /// Create (or re-create) the given indexes. Must be idempotent.
    async fn create_indexes(&self, collection: Collection, spec: &IndexSpec) -> Result<(), IndexerError>;

    /// Release connections. Called once during shutdown.
    async fn close(&self) -> Result<(), IndexerError> {
        Ok(())
    }
}
