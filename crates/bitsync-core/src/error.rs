//! Error types for the bitsync pipeline.

use thiserror::Error;

/// Errors that can occur while syncing.
///
/// Duplicate-key rejections are not represented here: backends report them
/// through [`InsertOutcome`](crate::store::InsertOutcome) instead.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Transform error in '{name}': {reason}")]
    Transform { name: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Sync aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error came from the chain node.
    ///
    /// Only a per-transaction fetch inside a batch may treat this as local;
    /// every other call site propagates it.
    pub fn is_rpc(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Returns `false` only for errors a caller may absorb locally: a single
    /// transaction fetch inside a batch, or a dropped notification.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Rpc(_) | Self::Notification(_))
    }

    /// Returns `true` for errors raised while compiling the filter spec.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Filter(_) | Self::Transform { .. } | Self::Config(_))
    }
}
