//! YAML configuration for the `bitsync` binary.
//!
//! ```yaml
//! rpc:
//!   url: http://127.0.0.1:8332
//!   user: bitcoin
//! storage:
//!   path: bitsync.db        # ":memory:" for a throwaway store
//! redis:
//!   url: redis://127.0.0.1/
//!   prefix: "bitsync:"
//! sync:
//!   genesis: 525470
//!   rpc_concurrency: 10
//!   fetch_policy: drop
//! index:
//!   confirmed:
//!     keys: [blk.i, out.s1]
//!     fulltext: [out.s1]
//! log:
//!   level: info
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use bitsync_bitcoin::pubsub::{BLOCK_CHANNEL, TX_CHANNEL};
use bitsync_bitcoin::{RpcConfig, SyncConfigBuilder};
use bitsync_core::filter::FilterSpec;
use bitsync_core::indexer::SyncConfig;
use bitsync_core::store::IndexConfig;

use crate::logging::LogConfig;

/// Overrides `rpc.password`.
pub const RPC_PASSWORD_ENV: &str = "BITSYNC_RPC_PASSWORD";

/// In-memory SQLite path.
pub const MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rpc: RpcConfig,
    pub storage: StorageConfig,
    /// Without a `redis` section, block sync runs on the fallback timer only.
    pub redis: Option<RedisConfig>,
    pub sync: SyncConfig,
    pub index: IndexConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "bitsync.db".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Prepended to the outbound `block` and `mempool` channels.
    pub prefix: String,
    pub tx_channel: String,
    pub block_channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".into(),
            prefix: "bitsync:".into(),
            tx_channel: TX_CHANNEL.into(),
            block_channel: BLOCK_CHANNEL.into(),
        }
    }
}

impl AppConfig {
    /// Read `path`, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_yaml(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(std::env::var(RPC_PASSWORD_ENV).ok());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env(&mut self, rpc_password: Option<String>) {
        if let Some(password) = rpc_password.filter(|p| !p.is_empty()) {
            self.rpc.password = Some(password);
        }
    }

    /// The engine configuration. A filter file's `from` replaces
    /// `sync.genesis`; the top-level `index` section replaces `sync.index`.
    pub fn sync_config(&self, filter: Option<&FilterSpec>) -> SyncConfig {
        let mut builder =
            SyncConfigBuilder::from_config(self.sync.clone()).indexes(self.index.clone());
        if let Some(spec) = filter {
            builder = builder.genesis(spec.from);
        }
        builder.build_config()
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.rpc.password.is_some() {
            copy.rpc.password = Some("********".into());
        }
        copy
    }
}
