//! bitsync-bitcoin — bitcoind adapter, block crawler, and sync engine.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bitsync_bitcoin::{BitcoindRpc, RpcConfig, SyncConfigBuilder, SyncEngine};
//! use bitsync_core::{BroadcastPublisher, FilterEngine};
//! use bitsync_core::notify::ChannelNotifications;
//! use bitsync_storage::InMemoryStorage;
//!
//! # async fn example() -> Result<(), bitsync_core::IndexerError> {
//! let rpc = Arc::new(BitcoindRpc::new(RpcConfig::default())?);
//! let store = Arc::new(InMemoryStorage::new());
//! let (publisher, _rx) = BroadcastPublisher::new(64);
//! let engine = Arc::new(SyncEngine::new(
//!     SyncConfigBuilder::new().genesis(525_470).build_config(),
//!     rpc,
//!     store.clone(),
//!     store,
//!     FilterEngine::pass_through(),
//!     Arc::new(publisher),
//! ));
//! let (notifications, _tx) = ChannelNotifications::new();
//! engine.start(&notifications, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod crawler;
pub mod pubsub;
pub mod rpc;
pub mod sync;
pub mod tna;

pub use builder::SyncConfigBuilder;
pub use crawler::BlockCrawler;
pub use pubsub::{RedisNotifications, RedisPublisher};
pub use rpc::{BitcoindRpc, RpcConfig};
pub use sync::SyncEngine;
