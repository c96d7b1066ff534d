//! Fluent builder API for sync configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use bitsync_bitcoin::SyncConfigBuilder;
//! use bitsync_core::indexer::FetchFailurePolicy;
//!
//! let config = SyncConfigBuilder::new()
//!     .genesis(525_470)
//!     .rpc_concurrency(8)
//!     .fetch_policy(FetchFailurePolicy::Abort)
//!     .build_config();
//! ```

use bitsync_core::indexer::{FetchFailurePolicy, SyncConfig};
use bitsync_core::store::IndexConfig;

/// Fluent builder for `SyncConfig`.
#[derive(Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Set the checkpoint key.
    pub fn indexer_id(mut self, id: impl Into<String>) -> Self {
        self.config.indexer_id = id.into();
        self
    }

    /// Set the genesis height. Sync starts at `genesis + 1`.
    pub fn genesis(mut self, height: u64) -> Self {
        self.config.genesis = height;
        self
    }

    /// Set max concurrent transaction fetches per crawl.
    pub fn rpc_concurrency(mut self, n: usize) -> Self {
        self.config.rpc_concurrency = n;
        self
    }

    /// Set max concurrent live mempool insertions.
    pub fn mempool_concurrency(mut self, n: usize) -> Self {
        self.config.mempool_concurrency = n;
        self
    }

    /// Set the number of documents per insert.
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n;
        self
    }

    /// Set the fallback sync period in milliseconds.
    pub fn fallback_interval_ms(mut self, ms: u64) -> Self {
        self.config.fallback_interval_ms = ms;
        self
    }

    pub fn fetch_policy(mut self, policy: FetchFailurePolicy) -> Self {
        self.config.fetch_policy = policy;
        self
    }

    /// Set the indexes created on a fresh index.
    pub fn indexes(mut self, index: IndexConfig) -> Self {
        self.config.index = index;
        self
    }

    /// Build the `SyncConfig`.
    pub fn build_config(self) -> SyncConfig {
        self.config
    }
}
