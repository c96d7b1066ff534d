//! `ChainSource` trait — the node the crawler reads from.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{BlockData, TxRecord};

/// Read access to a chain node.
///
/// `transaction` returns the record already converted to its document body;
/// the crawler stamps `blk` onto it for confirmed transactions.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Current best block height.
    async fn current_height(&self) -> Result<u64, IndexerError>;

    /// Header fields and txids of the block at `height`.
    async fn block_at(&self, height: u64) -> Result<BlockData, IndexerError>;

    /// One transaction by hash, unstamped.
    async fn transaction(&self, hash: &str) -> Result<TxRecord, IndexerError>;

    /// Txids currently in the node's mempool.
    async fn mempool_txids(&self) -> Result<Vec<String>, IndexerError>;
}
