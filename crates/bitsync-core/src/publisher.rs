//! Outbound event publishing.
//!
//! Publishing is fire-and-forget: no acknowledgement, no buffering. A message
//! with no subscriber is simply lost.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::Document;

/// Payload for an accepted block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    /// Block height.
    pub i: u64,
    /// The stored documents of that block.
    pub txs: Vec<Document>,
}

/// An event as seen by in-process subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishedEvent {
    Block(BlockMessage),
    Mempool(Document),
}

impl PublishedEvent {
    /// Topic name without prefix: `"block"` or `"mempool"`.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Mempool(_) => "mempool",
        }
    }

    /// JSON payload as sent over the wire.
    pub fn payload(&self) -> Value {
        match self {
            Self::Block(msg) => serde_json::to_value(msg).unwrap_or(Value::Null),
            Self::Mempool(doc) => doc.clone(),
        }
    }
}

/// Sink for accepted blocks and mempool transactions.
///
/// Implementations log their own failures and never return them.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    /// Called after the block is stored and the checkpoint advanced.
    async fn publish_block(&self, height: u64, txs: &[Document]);

    /// Called after the record is stored in the unconfirmed collection.
    async fn publish_mempool_tx(&self, doc: &Document);
}

// ─── Broadcast ────────────────────────────────────────────────────────────────

/// In-process publisher over a `tokio::sync::broadcast` channel.
///
/// Lagging receivers drop the oldest messages.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<PublishedEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<PublishedEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Subscribe to published events.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: PublishedEvent) {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(receivers) => debug!(topic, receivers, "event published"),
            Err(_) => warn!(topic, "No active subscribers"),
        }
    }
}

#[async_trait::async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish_block(&self, height: u64, txs: &[Document]) {
        self.send(PublishedEvent::Block(BlockMessage {
            i: height,
            txs: txs.to_vec(),
        }));
    }

    async fn publish_mempool_tx(&self, doc: &Document) {
        self.send(PublishedEvent::Mempool(doc.clone()));
    }
}
