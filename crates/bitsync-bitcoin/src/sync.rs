//! The sync engine — catch-up, mempool resync, live listening, and fix.
//!
//! # Startup
//! Read the tip. On a fresh index create the configured indexes, otherwise
//! re-crawl the block below the tip (`fix(tip - 1)`). Then catch up to the
//! node's height and replace the unconfirmed collection with the mempool.
//!
//! # Catch-up
//! Strictly sequential over `tip+1 ..= height`:
//!   - crawl and filter block `i`
//!   - append its documents
//!   - advance the tip to `i`
//!   - publish the block
//!
//! # Listening
//! Mempool notifications feed a queue drained with bounded concurrency.
//! Block notifications and the fallback timer re-run catch-up; a trigger that
//! arrives while catch-up is running is dropped. Any error from a spawned
//! task ends the listen loop. On exit, a running catch-up stops after its
//! current block and `listen` waits for every block sync it spawned.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use bitsync_core::checkpoint::{CheckpointManager, CheckpointStore};
use bitsync_core::error::IndexerError;
use bitsync_core::filter::FilterEngine;
use bitsync_core::indexer::{FetchFailurePolicy, SyncConfig, SyncState};
use bitsync_core::ingest::Ingestor;
use bitsync_core::notify::{Notification, NotificationSource};
use bitsync_core::publisher::EventPublisher;
use bitsync_core::source::ChainSource;
use bitsync_core::store::DocumentStore;

use crate::crawler::BlockCrawler;

/// Orchestrates the crawler, storage, checkpoint, and publisher.
pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn ChainSource>,
    crawler: BlockCrawler,
    ingestor: Ingestor,
    checkpoint: CheckpointManager,
    publisher: Arc<dyn EventPublisher>,
    state: watch::Sender<SyncState>,
    catch_up: Mutex<()>,
    stopping: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn ChainSource>,
        store: Arc<dyn DocumentStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        filter: FilterEngine,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let crawler = BlockCrawler::new(
            source.clone(),
            Arc::new(filter),
            config.rpc_concurrency,
            config.fetch_policy,
        );
        let checkpoint =
            CheckpointManager::new(checkpoints, config.indexer_id.clone(), config.genesis);
        let (state, _) = watch::channel(SyncState::Idle);

        Self {
            ingestor: Ingestor::with_chunk_size(store, config.chunk_size),
            crawler,
            checkpoint,
            publisher,
            source,
            state,
            catch_up: Mutex::new(()),
            stopping: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// The last fully ingested height (genesis if none).
    pub async fn tip(&self) -> Result<u64, IndexerError> {
        self.checkpoint.tip().await
    }

    fn set_state(&self, state: SyncState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(from = %prev, to = %state, "state changed");
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Run the startup sequence, then listen until shutdown or a fatal error.
    pub async fn start<S, F>(
        self: Arc<Self>,
        notifications: &S,
        shutdown: F,
    ) -> Result<(), IndexerError>
    where
        S: NotificationSource + ?Sized,
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        tokio::select! {
            result = self.bootstrap() => result?,
            _ = &mut shutdown => {
                info!("shutdown requested during startup");
                self.set_state(SyncState::Stopped);
                return Ok(());
            }
        }
        self.listen(notifications, shutdown).await
    }

    /// Startup: index setup or fix, catch-up, then an unconditional mempool
    /// resync.
    pub async fn bootstrap(&self) -> Result<(), IndexerError> {
        let tip = self.checkpoint.tip().await?;
        if tip == self.checkpoint.genesis() {
            info!(genesis = tip, "fresh index, creating indexes");
            self.reindex().await?;
        } else {
            self.fix(Some(tip.saturating_sub(1))).await?;
        }

        let _guard = self.catch_up.lock().await;
        self.catch_up().await?;
        self.resync_mempool().await?;
        Ok(())
    }

    /// React to notifications and the fallback timer until `shutdown`
    /// resolves or a fatal error occurs.
    pub async fn listen<S, F>(self: Arc<Self>, notifications: &S, shutdown: F) -> Result<(), IndexerError>
    where
        S: NotificationSource + ?Sized,
        F: Future<Output = ()> + Send,
    {
        let mut stream = notifications.subscribe().await?;
        let mut stream_open = true;

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<IndexerError>();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<String>();
        let worker = tokio::spawn(Arc::clone(&self).drain_mempool_queue(queue_rx, fatal_tx.clone()));
        let mut block_syncs = JoinSet::new();

        let period = Duration::from_millis(self.config.fallback_interval_ms.max(1));
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.set_state(SyncState::Listening);
        info!(fallback_ms = period.as_millis() as u64, "listening");

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                Some(err) = fatal_rx.recv() => break Err(err),
                Some(_) = block_syncs.join_next(), if !block_syncs.is_empty() => {}
                _ = timer.tick() => {
                    debug!("fallback timer fired");
                    self.spawn_block_sync(&mut block_syncs, &fatal_tx);
                }
                item = stream.next(), if stream_open => match item {
                    Some(Ok(Notification::MempoolTx(hash))) => {
                        debug!(%hash, "mempool notification");
                        let _ = queue_tx.send(hash);
                    }
                    Some(Ok(Notification::Block)) => {
                        debug!("block notification");
                        self.spawn_block_sync(&mut block_syncs, &fatal_tx);
                    }
                    Some(Err(e)) if !e.is_fatal() => warn!(error = %e, "notification dropped"),
                    Some(Err(e)) => break Err(e),
                    None => {
                        warn!("notification stream ended, relying on fallback timer");
                        stream_open = false;
                    }
                },
            }
        };

        drop(queue_tx);
        worker.abort();
        let _ = worker.await;

        self.stopping.store(true, Ordering::SeqCst);
        while block_syncs.join_next().await.is_some() {}
        self.stopping.store(false, Ordering::SeqCst);
        while let Ok(e) = fatal_rx.try_recv() {
            warn!(error = %e, "error from block sync after shutdown");
        }
        self.set_state(SyncState::Stopped);
        if let Err(e) = &result {
            error!(error = %e, "sync stopped on fatal error");
        }
        result
    }

    /// Release store connections.
    pub async fn close(&self) -> Result<(), IndexerError> {
        self.ingestor.store().close().await
    }

    // ─── Block sync ───────────────────────────────────────────────────────────

    /// Catch up once. Returns the number of blocks ingested, or 0 if another
    /// catch-up is already running.
    pub async fn sync_blocks(&self) -> Result<u64, IndexerError> {
        let Ok(_guard) = self.catch_up.try_lock() else {
            debug!("catch-up already running, trigger dropped");
            return Ok(0);
        };
        self.catch_up().await
    }

    /// Caller must hold `catch_up`.
    async fn catch_up(&self) -> Result<u64, IndexerError> {
        let tip = self.checkpoint.tip().await?;
        let height = self.source.current_height().await?;
        debug!(tip, height, "sync check");
        if tip >= height {
            return Ok(0);
        }

        self.set_state(SyncState::CatchingUp);
        info!(from = tip + 1, to = height, "catching up");
        let mut done = 0;
        for i in tip + 1..=height {
            if self.stopping.load(Ordering::SeqCst) {
                info!(tip = i - 1, "catch-up interrupted by shutdown");
                return Ok(done);
            }
            let docs = self.crawler.crawl(i).await?;
            self.ingestor.append(&docs, i).await?;
            self.checkpoint.advance(i).await?;
            self.publisher.publish_block(i, &docs).await;
            done += 1;
        }
        info!(tip = height, "caught up");
        Ok(done)
    }

    /// A block notification or timer tick.
    async fn on_block_trigger(&self) -> Result<(), IndexerError> {
        let Ok(_guard) = self.catch_up.try_lock() else {
            debug!("catch-up already running, trigger dropped");
            return Ok(());
        };
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.catch_up().await? > 0 && !self.stopping.load(Ordering::SeqCst) {
            self.resync_mempool().await?;
        }
        self.set_state(SyncState::Listening);
        Ok(())
    }

    fn spawn_block_sync(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        fatal: &mpsc::UnboundedSender<IndexerError>,
    ) {
        let engine = Arc::clone(self);
        let fatal = fatal.clone();
        tasks.spawn(async move {
            if let Err(e) = engine.on_block_trigger().await {
                let _ = fatal.send(e);
            }
        });
    }

    // ─── Mempool ──────────────────────────────────────────────────────────────

    /// Replace the unconfirmed collection with the node's current mempool.
    pub async fn resync_mempool(&self) -> Result<u64, IndexerError> {
        self.set_state(SyncState::MempoolResync);
        let docs = self.crawler.crawl_mempool().await?;
        let outcome = self.ingestor.replace_mempool(&docs).await?;
        Ok(outcome.inserted as u64)
    }

    /// Fetch, store, and publish one new mempool transaction.
    ///
    /// Returns `false` if the transaction was skipped (duplicate or dropped).
    pub async fn ingest_mempool_tx(&self, hash: &str) -> Result<bool, IndexerError> {
        let doc = match self.crawler.fetch_mempool_tx(hash).await {
            Ok(doc) => doc,
            Err(e) if self.config.fetch_policy == FetchFailurePolicy::Drop && !e.is_fatal() => {
                warn!(%hash, error = %e, "mempool transaction fetch failed, skipping");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if !self.ingestor.append_mempool(&doc).await? {
            debug!(%hash, "mempool transaction already stored");
            return Ok(false);
        }
        self.publisher.publish_mempool_tx(&doc).await;
        Ok(true)
    }

    async fn drain_mempool_queue(
        self: Arc<Self>,
        rx: mpsc::UnboundedReceiver<String>,
        fatal: mpsc::UnboundedSender<IndexerError>,
    ) {
        let queue = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|hash| (Ok::<_, IndexerError>(hash), rx))
        });
        let limit = self.config.mempool_concurrency.max(1);
        let result = queue
            .try_for_each_concurrent(limit, |hash| {
                let engine = Arc::clone(&self);
                async move { engine.ingest_mempool_tx(&hash).await.map(|_| ()) }
            })
            .await;
        if let Err(e) = result {
            let _ = fatal.send(e);
        }
    }

    // ─── Administration ───────────────────────────────────────────────────────

    /// Re-crawl block `height` (default: the current tip), replace every
    /// confirmed record at or above it, and set the tip to `height`.
    pub async fn fix(&self, height: Option<u64>) -> Result<u64, IndexerError> {
        let _guard = self.catch_up.lock().await;
        let target = match height {
            Some(h) => h,
            None => self.checkpoint.tip().await?,
        };

        self.set_state(SyncState::Fixing);
        info!(height = target, "fixing block");
        let docs = self.crawler.crawl(target).await?;
        self.ingestor.replace_range(&docs, target).await?;
        self.checkpoint.rewind(target).await?;
        info!(height = target, records = docs.len(), "block fixed");
        Ok(target)
    }

    /// Clear both collections and delete the tip.
    pub async fn reset(&self) -> Result<(), IndexerError> {
        let _guard = self.catch_up.lock().await;
        self.ingestor.reset_confirmed().await?;
        self.ingestor.reset_mempool().await?;
        self.checkpoint.clear().await?;
        info!("index reset");
        Ok(())
    }

    /// Create the configured indexes on both collections.
    pub async fn reindex(&self) -> Result<(), IndexerError> {
        self.ingestor.ensure_indexes(&self.config.index).await
    }
}
