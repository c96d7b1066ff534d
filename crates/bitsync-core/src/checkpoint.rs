//! Checkpoint manager — persists the sync tip for crash recovery.
//!
//! A checkpoint stores the highest block height whose transactions are fully
//! and durably indexed. On restart, sync resumes from it rather than
//! re-indexing from genesis.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Default checkpoint key.
pub const DEFAULT_INDEXER_ID: &str = "tip";

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint key (one row per indexer).
    pub indexer_id: String,
    /// Highest fully ingested block height.
    pub block_number: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// A `save` that returns `Ok` must survive an immediate process crash.
/// Implementations include `MemoryCheckpointStore`, `InMemoryStorage`, and
/// `SqliteStorage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for an indexer (`None` if never saved).
    async fn load(&self, indexer_id: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. when resetting an indexer).
    async fn delete(&self, indexer_id: &str) -> Result<(), IndexerError>;
}

/// Reads and writes the tip for one indexer, defaulting to genesis.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    indexer_id: String,
    genesis: u64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, indexer_id: impl Into<String>, genesis: u64) -> Self {
        Self {
            store,
            indexer_id: indexer_id.into(),
            genesis,
        }
    }

    /// The configured genesis height.
    pub fn genesis(&self) -> u64 {
        self.genesis
    }

    /// The current tip. Returns genesis if no checkpoint was ever saved.
    pub async fn tip(&self) -> Result<u64, IndexerError> {
        match self.store.load(&self.indexer_id).await? {
            Some(cp) => {
                tracing::debug!(tip = cp.block_number, "checkpoint found");
                Ok(cp.block_number)
            }
            None => {
                tracing::info!(genesis = self.genesis, "checkpoint not found, starting from genesis");
                Ok(self.genesis)
            }
        }
    }

    /// Record that `block_number` is fully ingested.
    ///
    /// Call only after the block's records are durably stored.
    pub async fn advance(&self, block_number: u64) -> Result<(), IndexerError> {
        self.write(block_number).await?;
        tracing::debug!(tip = block_number, "tip updated");
        Ok(())
    }

    /// Move the tip backwards. Used only by the fix procedure.
    pub async fn rewind(&self, block_number: u64) -> Result<(), IndexerError> {
        self.write(block_number).await?;
        tracing::info!(tip = block_number, "tip rewound");
        Ok(())
    }

    /// Delete the checkpoint; the next `tip()` returns genesis.
    pub async fn clear(&self) -> Result<(), IndexerError> {
        self.store.delete(&self.indexer_id).await?;
        tracing::info!(indexer_id = %self.indexer_id, "tip deleted");
        Ok(())
    }

    async fn write(&self, block_number: u64) -> Result<(), IndexerError> {
        let cp = Checkpoint {
            indexer_id: self.indexer_id.clone(),
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, indexer_id: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.data.lock().unwrap().get(indexer_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        self.data
            .lock()
            .unwrap()
            .insert(checkpoint.indexer_id.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, indexer_id: &str) -> Result<(), IndexerError> {
        self.data.lock().unwrap().remove(indexer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(genesis: u64) -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), DEFAULT_INDEXER_ID, genesis)
    }

    #[tokio::test]
    async fn tip_defaults_to_genesis() {
        let mgr = manager(525_470);
        assert_eq!(mgr.tip().await.unwrap(), 525_470);
    }

    #[tokio::test]
    async fn advance_roundtrip() {
        let mgr = manager(0);
        mgr.advance(1000).await.unwrap();
        assert_eq!(mgr.tip().await.unwrap(), 1000);
        mgr.advance(1001).await.unwrap();
        assert_eq!(mgr.tip().await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn rewind_and_clear() {
        let mgr = manager(10);
        mgr.advance(50).await.unwrap();
        mgr.rewind(40).await.unwrap();
        assert_eq!(mgr.tip().await.unwrap(), 40);

        mgr.clear().await.unwrap();
        assert_eq!(mgr.tip().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn indexers_are_isolated() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let a = CheckpointManager::new(store.clone(), "a", 0);
        let b = CheckpointManager::new(store.clone(), "b", 7);
        a.advance(99).await.unwrap();
        assert_eq!(b.tip().await.unwrap(), 7);
        assert_eq!(store.load("a").await.unwrap().unwrap().block_number, 99);
    }
}
