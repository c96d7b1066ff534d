//! Sync configuration and state types.

use serde::{Deserialize, Serialize};

use crate::checkpoint::DEFAULT_INDEXER_ID;
use crate::store::IndexConfig;

/// What to do when a single transaction fetch fails inside a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchFailurePolicy {
    /// Log and drop the transaction from the batch; the block still ingests.
    #[default]
    Drop,
    /// Fail the whole batch (fatal for a block crawl).
    Abort,
}

/// Configuration for a sync engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Checkpoint key.
    pub indexer_id: String,
    /// Tip assumed when no checkpoint exists. Sync starts at `genesis + 1`.
    pub genesis: u64,
    /// Max in-flight transaction fetches per block or mempool crawl.
    pub rpc_concurrency: usize,
    /// Max in-flight live mempool insertions.
    pub mempool_concurrency: usize,
    /// Documents per insert-many call.
    pub chunk_size: usize,
    /// Fallback sync timer period (milliseconds).
    pub fallback_interval_ms: u64,
    /// Per-transaction fetch failure handling.
    pub fetch_policy: FetchFailurePolicy,
    /// Secondary and full-text indexes, created on a fresh index.
    pub index: IndexConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            indexer_id: DEFAULT_INDEXER_ID.into(),
            genesis: 0,
            rpc_concurrency: 10,
            mempool_concurrency: 10,
            chunk_size: crate::ingest::CHUNK_SIZE,
            fallback_interval_ms: 60_000,
            fetch_policy: FetchFailurePolicy::Drop,
            index: IndexConfig::default(),
        }
    }
}

/// Runtime state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Not yet started.
    Idle,
    /// Re-indexing a block during recovery.
    Fixing,
    /// Sequentially ingesting blocks up to the chain height.
    CatchingUp,
    /// Replacing the unconfirmed store with the node's mempool.
    MempoolResync,
    /// Reacting to notifications and the fallback timer.
    Listening,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fixing => write!(f, "fixing"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::MempoolResync => write!(f, "mempool-resync"),
            Self::Listening => write!(f, "listening"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
