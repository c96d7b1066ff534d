//! Block and mempool crawler.
//!
//! Transaction bodies are fetched with at most `concurrency` requests in
//! flight. This is the only fan-out point in the pipeline.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use bitsync_core::error::IndexerError;
use bitsync_core::filter::FilterEngine;
use bitsync_core::indexer::FetchFailurePolicy;
use bitsync_core::source::ChainSource;
use bitsync_core::types::{BlockDescriptor, Document, TxRecord};

/// Fetches, stamps, and filters transactions for one block at a time.
pub struct BlockCrawler {
    source: Arc<dyn ChainSource>,
    filter: Arc<FilterEngine>,
    concurrency: usize,
    policy: FetchFailurePolicy,
}

impl BlockCrawler {
    pub fn new(
        source: Arc<dyn ChainSource>,
        filter: Arc<FilterEngine>,
        concurrency: usize,
        policy: FetchFailurePolicy,
    ) -> Self {
        Self {
            source,
            filter,
            concurrency: concurrency.max(1),
            policy,
        }
    }

    /// Crawl block `height` and return its filtered documents.
    ///
    /// Failure to fetch the block itself is always fatal.
    pub async fn crawl(&self, height: u64) -> Result<Vec<Document>, IndexerError> {
        let block = self.source.block_at(height).await?;
        let blk = block.descriptor(height);
        let total = block.txids.len();
        debug!(height, txs = total, "crawling block");

        let records = self.fetch_all(block.txids, Some(blk)).await?;
        let fetched = records.len();
        let docs = self.filter.apply(records)?;

        info!(height, txs = total, fetched, filtered = docs.len(), "block crawled");
        Ok(docs)
    }

    /// Fetch every transaction currently in the mempool (unfiltered).
    pub async fn crawl_mempool(&self) -> Result<Vec<Document>, IndexerError> {
        let txids = self.source.mempool_txids().await?;
        let total = txids.len();
        let records = self.fetch_all(txids, None).await?;
        info!(txs = total, fetched = records.len(), "mempool crawled");
        Ok(records.into_iter().map(TxRecord::into_document).collect())
    }

    /// Fetch one mempool transaction as a document.
    pub async fn fetch_mempool_tx(&self, hash: &str) -> Result<Document, IndexerError> {
        Ok(self.source.transaction(hash).await?.into_document())
    }

    async fn fetch_all(
        &self,
        txids: Vec<String>,
        blk: Option<BlockDescriptor>,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let mut results = stream::iter(txids)
            .map(|hash| {
                let source = self.source.clone();
                async move {
                    let result = source.transaction(&hash).await;
                    (hash, result)
                }
            })
            .buffer_unordered(self.concurrency);

        let mut records = Vec::new();
        while let Some((hash, result)) = results.next().await {
            match result {
                Ok(mut record) => {
                    if let Some(blk) = &blk {
                        record.stamp(blk.clone());
                    }
                    records.push(record);
                }
                Err(e) if self.policy == FetchFailurePolicy::Drop && !e.is_fatal() => {
                    warn!(%hash, error = %e, "transaction fetch failed, dropping from batch");
                }
                Err(e) => {
                    return Err(IndexerError::Aborted {
                        reason: format!("fetch {hash}: {e}"),
                    })
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bitsync_core::types::BlockData;
    use serde_json::{json, Map};

    struct OneBlock {
        missing: &'static str,
    }

    #[async_trait]
    impl ChainSource for OneBlock {
        async fn current_height(&self) -> Result<u64, IndexerError> {
            Ok(5)
        }
        async fn block_at(&self, _: u64) -> Result<BlockData, IndexerError> {
            Ok(BlockData {
                hash: "b5".into(),
                time: 50,
                txids: vec!["t1".into(), "t2".into(), "t3".into()],
            })
        }
        async fn transaction(&self, hash: &str) -> Result<TxRecord, IndexerError> {
            if hash == self.missing {
                return Err(IndexerError::Rpc("No such transaction".into()));
            }
            let body = json!({ "out": [] });
            Ok(TxRecord::new(hash, body.as_object().cloned().unwrap_or_else(Map::new)))
        }
        async fn mempool_txids(&self) -> Result<Vec<String>, IndexerError> {
            Ok(vec!["m1".into(), "t2".into()])
        }
    }

    fn crawler(policy: FetchFailurePolicy) -> BlockCrawler {
        BlockCrawler::new(
            Arc::new(OneBlock { missing: "t2" }),
            Arc::new(FilterEngine::pass_through()),
            2,
            policy,
        )
    }

    #[tokio::test]
    async fn stamps_block_descriptor() {
        let docs = crawler(FetchFailurePolicy::Drop).crawl(5).await.unwrap();
        assert_eq!(docs.len(), 2);
        for doc in &docs {
            assert_eq!(doc["blk"], json!({ "i": 5, "h": "b5", "t": 50 }));
        }
    }

    #[tokio::test]
    async fn abort_policy_fails_batch() {
        let err = crawler(FetchFailurePolicy::Abort).crawl(5).await.unwrap_err();
        assert!(matches!(err, IndexerError::Aborted { .. }));
    }

    #[tokio::test]
    async fn mempool_records_are_unstamped() {
        let docs = crawler(FetchFailurePolicy::Drop).crawl_mempool().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["tx"]["h"], "m1");
        assert!(docs[0].get("blk").is_none());
    }
}
