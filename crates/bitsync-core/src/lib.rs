//! bitsync-core — traits and protocols for the Bitcoin crawler and sync engine.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine (bitsync-bitcoin)
//!     ├── ChainSource        (node RPC: height, blocks, txs, mempool)
//!     ├── FilterEngine       (compiled query + TransformRegistry)
//!     ├── Ingestor           (chunked writes over a DocumentStore)
//!     ├── CheckpointManager  (durable "tip" for crash recovery)
//!     ├── EventPublisher     (block / mempool fan-out)
//!     └── NotificationSource (live "new tx" / "new block" triggers)
//! ```

pub mod checkpoint;
pub mod error;
pub mod filter;
pub mod indexer;
pub mod ingest;
pub mod notify;
pub mod publisher;
pub mod source;
pub mod store;
pub mod transform;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
pub use error::IndexerError;
pub use filter::{FilterEngine, FilterSpec};
pub use indexer::{FetchFailurePolicy, SyncConfig, SyncState};
pub use ingest::Ingestor;
pub use notify::{Notification, NotificationSource, NotificationStream};
pub use publisher::{BlockMessage, BroadcastPublisher, EventPublisher, PublishedEvent};
pub use source::ChainSource;
pub use store::{Collection, DocumentStore, IndexConfig, IndexSpec, InsertOutcome};
pub use transform::{Transform, TransformRegistry};
pub use types::{BlockData, BlockDescriptor, Document, TxRecord};
