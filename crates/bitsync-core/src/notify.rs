//! Inbound live notifications from the node.
//!
//! Delivery is not exactly-once. The fallback timer in the sync engine covers
//! anything missed here.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::IndexerError;

/// A live notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A new unconfirmed transaction (hex hash).
    MempoolTx(String),
    /// A new block was connected.
    Block,
}

/// Stream of notifications from one source.
pub type NotificationStream =
    Pin<Box<dyn Stream<Item = Result<Notification, IndexerError>> + Send>>;

/// A subscribable notification backend.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Connect and start streaming notifications.
    async fn subscribe(&self) -> Result<NotificationStream, IndexerError>;
}

// ─── Channel source ───────────────────────────────────────────────────────────

/// Notifications fed from an in-process channel.
///
/// `subscribe` can be called once; later calls return an empty stream.
pub struct ChannelNotifications {
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl ChannelNotifications {
    pub fn new() -> (Self, mpsc::UnboundedSender<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: tokio::sync::Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl NotificationSource for ChannelNotifications {
    async fn subscribe(&self) -> Result<NotificationStream, IndexerError> {
        let Some(rx) = self.rx.lock().await.take() else {
            return Ok(Box::pin(futures::stream::empty()));
        };
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (Ok(n), rx))
        })))
    }
}
