//! Redis pub/sub adapters.
//!
//! - [`RedisPublisher`] publishes accepted blocks and mempool transactions as
//!   JSON on `<prefix>block` and `<prefix>mempool`.
//! - [`RedisNotifications`] subscribes to `hashtx` / `hashblock` channels fed
//!   by a node-side relay. Payloads are transaction or block hashes, either as
//!   32 raw bytes or as 64 hex characters.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use bitsync_core::error::IndexerError;
use bitsync_core::notify::{Notification, NotificationSource, NotificationStream};
use bitsync_core::publisher::{BlockMessage, EventPublisher, PublishedEvent};
use bitsync_core::types::Document;

/// Default inbound channel for new mempool transaction hashes.
pub const TX_CHANNEL: &str = "hashtx";
/// Default inbound channel for new block hashes.
pub const BLOCK_CHANNEL: &str = "hashblock";

fn notify_err(e: redis::RedisError) -> IndexerError {
    IndexerError::Notification(e.to_string())
}

// ─── Publisher ────────────────────────────────────────────────────────────────

/// Redis publisher for accepted blocks and mempool transactions.
pub struct RedisPublisher {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisPublisher {
    /// Create a publisher over an established connection.
    pub fn new(connection: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    /// Open a connection to `url` and create a publisher.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, IndexerError> {
        let client = redis::Client::open(url)
            .map_err(|e| IndexerError::Config(format!("redis url: {e}")))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(notify_err)?;
        let publisher = Self::new(connection, prefix);
        info!(url, prefix = %publisher.prefix, "redis publisher connected");
        Ok(publisher)
    }

    /// Full channel name for a topic.
    pub fn channel(&self, topic: &str) -> String {
        format!("{}{topic}", self.prefix)
    }

    async fn publish_event(&self, event: PublishedEvent) {
        let channel = self.channel(event.topic());
        let payload = event.payload().to_string();
        let mut conn = self.connection.clone();
        match conn.publish::<_, _, i64>(&channel, payload).await {
            Ok(receivers) => debug!(%channel, receivers, "event published"),
            Err(e) => warn!(%channel, error = %e, "publish failed"),
        }
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish_block(&self, height: u64, txs: &[Document]) {
        self.publish_event(PublishedEvent::Block(BlockMessage {
            i: height,
            txs: txs.to_vec(),
        }))
        .await;
    }

    async fn publish_mempool_tx(&self, doc: &Document) {
        self.publish_event(PublishedEvent::Mempool(doc.clone())).await;
    }
}

// ─── Notifications ────────────────────────────────────────────────────────────

/// Live notifications from Redis pub/sub.
#[derive(Debug)]
pub struct RedisNotifications {
    client: redis::Client,
    tx_channel: String,
    block_channel: String,
}

impl RedisNotifications {
    pub fn new(url: &str) -> Result<Self, IndexerError> {
        Self::with_channels(url, TX_CHANNEL, BLOCK_CHANNEL)
    }

    pub fn with_channels(
        url: &str,
        tx_channel: impl Into<String>,
        block_channel: impl Into<String>,
    ) -> Result<Self, IndexerError> {
        let client = redis::Client::open(url)
            .map_err(|e| IndexerError::Config(format!("redis url: {e}")))?;
        Ok(Self {
            client,
            tx_channel: tx_channel.into(),
            block_channel: block_channel.into(),
        })
    }
}

#[async_trait]
impl NotificationSource for RedisNotifications {
    async fn subscribe(&self) -> Result<NotificationStream, IndexerError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(notify_err)?;
        pubsub.subscribe(&self.tx_channel).await.map_err(notify_err)?;
        pubsub.subscribe(&self.block_channel).await.map_err(notify_err)?;
        info!(tx = %self.tx_channel, block = %self.block_channel, "subscribed to notifications");

        let tx_channel = self.tx_channel.clone();
        let block_channel = self.block_channel.clone();
        let stream = pubsub.into_on_message().map(move |msg| {
            decode(
                msg.get_channel_name(),
                msg.get_payload_bytes(),
                &tx_channel,
                &block_channel,
            )
        });
        Ok(Box::pin(stream))
    }
}

fn decode(
    channel: &str,
    payload: &[u8],
    tx_channel: &str,
    block_channel: &str,
) -> Result<Notification, IndexerError> {
    if channel == tx_channel {
        Ok(Notification::MempoolTx(payload_hash(payload)?))
    } else if channel == block_channel {
        Ok(Notification::Block)
    } else {
        Err(IndexerError::Notification(format!("unexpected channel {channel}")))
    }
}

/// Normalize a hash payload to lowercase hex.
fn payload_hash(payload: &[u8]) -> Result<String, IndexerError> {
    if payload.len() == 32 {
        return Ok(hex::encode(payload));
    }
    let text = std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|e| IndexerError::Notification(format!("hash payload: {e}")))?;
    match hex::decode(text) {
        Ok(bytes) if bytes.len() == 32 => Ok(text.to_ascii_lowercase()),
        _ => Err(IndexerError::Notification(format!(
            "hash payload is not a 32-byte hash: {text}"
        ))),
    }
}
