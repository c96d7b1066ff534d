//! Sync engine scenarios against a scripted chain and the in-memory store.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map};
use tokio::sync::{broadcast, oneshot};

use bitsync_bitcoin::{SyncConfigBuilder, SyncEngine};
use bitsync_core::checkpoint::CheckpointStore;
use bitsync_core::filter::{FilterEngine, FilterSpec};
use bitsync_core::indexer::{SyncConfig, SyncState};
use bitsync_core::notify::{ChannelNotifications, Notification};
use bitsync_core::publisher::{BroadcastPublisher, PublishedEvent};
use bitsync_core::source::ChainSource;
use bitsync_core::store::{Collection, DocumentStore};
use bitsync_core::transform::TransformRegistry;
use bitsync_core::types::{BlockData, TxRecord};
use bitsync_core::IndexerError;
use bitsync_storage::InMemoryStorage;

// ─── Mock chain ──────────────────────────────────────────────────────────────

/// A scripted node. Block `h` holds txs `"{h}-0" .. "{h}-{n-1}"`.
#[derive(Default)]
struct MockChain {
    height: AtomicU64,
    blocks: Mutex<BTreeMap<u64, BlockData>>,
    mempool: Mutex<Vec<String>>,
    fetch_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_height: AtomicBool,
    /// When set, every `block_at(h)` records `(h, tip)`.
    tips: Mutex<Option<Arc<InMemoryStorage>>>,
    observed: Mutex<Vec<(u64, u64)>>,
}

impl MockChain {
    fn with_blocks(heights: impl IntoIterator<Item = u64>, txs_per_block: usize) -> Arc<Self> {
        let chain = Arc::new(Self::default());
        for h in heights {
            chain.push_block(h, txs_per_block);
        }
        chain
    }

    fn push_block(&self, height: u64, txs: usize) {
        let block = BlockData {
            hash: format!("{height:064x}"),
            time: 1_700_000_000 + height as i64,
            txids: (0..txs).map(|i| format!("{height}-{i}")).collect(),
        };
        self.blocks.lock().unwrap().insert(height, block);
        self.height.fetch_max(height, Ordering::SeqCst);
    }

    fn set_mempool(&self, txids: &[&str]) {
        *self.mempool.lock().unwrap() = txids.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        if self.fail_height.load(Ordering::SeqCst) {
            return Err(IndexerError::Rpc("connection refused".into()));
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn block_at(&self, height: u64) -> Result<BlockData, IndexerError> {
        let tips = self.tips.lock().unwrap().clone();
        if let Some(store) = tips {
            let tip = store.load("tip").await?.map(|cp| cp.block_number).unwrap_or(0);
            self.observed.lock().unwrap().push((height, tip));
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or_else(|| IndexerError::Rpc(format!("block {height} not found")))
    }

    async fn transaction(&self, hash: &str) -> Result<TxRecord, IndexerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let tag = if hash.ends_with("-0") { "hello" } else { "other" };
        let body = json!({ "out": [{ "i": 0, "s0": "OP_RETURN", "s1": tag }], "lock": 0 });
        Ok(TxRecord::new(hash, body.as_object().cloned().unwrap_or_else(Map::new)))
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, IndexerError> {
        Ok(self.mempool.lock().unwrap().clone())
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    chain: Arc<MockChain>,
    store: Arc<InMemoryStorage>,
    engine: Arc<SyncEngine>,
    events: broadcast::Receiver<PublishedEvent>,
}

fn harness(chain: Arc<MockChain>, genesis: u64, k: usize, filter: FilterEngine) -> Harness {
    let config = SyncConfigBuilder::new()
        .genesis(genesis)
        .rpc_concurrency(k)
        .mempool_concurrency(2)
        .fallback_interval_ms(60_000)
        .build_config();
    harness_with(chain, config, filter)
}

fn harness_with(chain: Arc<MockChain>, config: SyncConfig, filter: FilterEngine) -> Harness {
    let store = Arc::new(InMemoryStorage::new());
    let (publisher, events) = BroadcastPublisher::new(1024);
    let engine = Arc::new(SyncEngine::new(
        config,
        chain.clone(),
        store.clone(),
        store.clone(),
        filter,
        Arc::new(publisher),
    ));
    Harness {
        chain,
        store,
        engine,
        events,
    }
}

async fn confirmed_hashes(store: &InMemoryStorage) -> Vec<String> {
    store.hashes(Collection::Confirmed).await.unwrap()
}

/// Run `listen` in the background until the returned sender fires.
fn spawn_listen(
    engine: &Arc<SyncEngine>,
    notifications: ChannelNotifications,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<(), IndexerError>>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let engine = engine.clone();
    let task = tokio::spawn(async move {
        engine
            .listen(&notifications, async {
                let _ = stop_rx.await;
            })
            .await
    });
    (stop_tx, task)
}

async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

// ─── Catch-up ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sequential_catch_up_advances_tip_before_next_crawl() {
    let chain = MockChain::with_blocks(101..=103, 2);
    let mut h = harness(chain, 100, 4, FilterEngine::pass_through());
    *h.chain.tips.lock().unwrap() = Some(h.store.clone());

    assert_eq!(h.engine.sync_blocks().await.unwrap(), 3);
    assert_eq!(h.engine.tip().await.unwrap(), 103);

    // nothing saved yet when 101 is crawled, so the mock reports 0 there
    assert_eq!(
        *h.chain.observed.lock().unwrap(),
        vec![(101, 0), (102, 101), (103, 102)]
    );

    let published: Vec<u64> = (0..3)
        .map(|_| match h.events.try_recv().unwrap() {
            PublishedEvent::Block(msg) => msg.i,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(published, vec![101, 102, 103]);
    assert_eq!(confirmed_hashes(&h.store).await.len(), 6);

    // already at the chain height
    assert_eq!(h.engine.sync_blocks().await.unwrap(), 0);
}

#[tokio::test]
async fn filter_applies_to_blocks_but_not_mempool() {
    let chain = MockChain::with_blocks(11..=15, 2);
    let spec = FilterSpec::from_json(r#"{ "from": 10, "filter": { "q": { "find": { "out.s1": "hello" } } } }"#)
        .unwrap();
    let filter = FilterEngine::compile(&spec, &TransformRegistry::with_builtins()).unwrap();
    let h = harness(chain, spec.from, 4, filter);

    h.engine.sync_blocks().await.unwrap();
    assert_eq!(confirmed_hashes(&h.store).await, vec!["11-0", "12-0", "13-0", "14-0", "15-0"]);

    h.chain.set_mempool(&["m-1"]);
    h.engine.resync_mempool().await.unwrap();
    assert_eq!(h.store.count(Collection::Unconfirmed).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_trigger_is_dropped() {
    let chain = MockChain::with_blocks(1..=3, 1);
    *chain.fetch_delay.lock().unwrap() = Duration::from_millis(20);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());

    let (a, b) = tokio::join!(h.engine.sync_blocks(), h.engine.sync_blocks());
    let mut counts = vec![a.unwrap(), b.unwrap()];
    counts.sort();
    assert_eq!(counts, vec![0, 3]);
    assert_eq!(confirmed_hashes(&h.store).await.len(), 3);
}

// ─── Bounded concurrency ─────────────────────────────────────────────────────

#[tokio::test]
async fn crawl_never_exceeds_k_fetches_in_flight() {
    let chain = MockChain::with_blocks([1], 10);
    *chain.fetch_delay.lock().unwrap() = Duration::from_millis(15);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());

    h.engine.sync_blocks().await.unwrap();
    assert_eq!(confirmed_hashes(&h.store).await.len(), 10);
    let max = h.chain.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 4, "saw {max} fetches in flight");
    assert!(max >= 2);
}

// ─── Fix / crash recovery ────────────────────────────────────────────────────

#[tokio::test]
async fn fix_then_catch_up_leaves_no_duplicates() {
    let chain = MockChain::with_blocks(98..=102, 3);
    let h = harness(chain, 97, 4, FilterEngine::pass_through());
    h.engine.sync_blocks().await.unwrap();
    assert_eq!(h.engine.tip().await.unwrap(), 102);

    assert_eq!(h.engine.fix(Some(100)).await.unwrap(), 100);
    assert_eq!(h.engine.tip().await.unwrap(), 100);
    let after_fix = confirmed_hashes(&h.store).await;
    assert_eq!(after_fix.len(), 9);
    assert!(after_fix.iter().all(|hash| !hash.starts_with("101-") && !hash.starts_with("102-")));

    assert_eq!(h.engine.sync_blocks().await.unwrap(), 2);
    let hashes = confirmed_hashes(&h.store).await;
    let unique: HashSet<_> = hashes.iter().collect();
    assert_eq!(hashes.len(), 15);
    assert_eq!(unique.len(), 15);
}

#[tokio::test]
async fn restart_after_crash_between_insert_and_advance() {
    let chain = MockChain::with_blocks(1..=3, 2);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());
    h.engine.sync_blocks().await.unwrap();

    // block 4 stored partially, tip never advanced
    h.chain.push_block(4, 2);
    let partial = vec![json!({ "tx": { "h": "4-0" }, "blk": { "i": 4, "h": "x", "t": 0 } })];
    h.store.insert_many(Collection::Confirmed, &partial).await.unwrap();

    h.engine.bootstrap().await.unwrap();
    assert_eq!(h.engine.tip().await.unwrap(), 4);

    let hashes = confirmed_hashes(&h.store).await;
    assert_eq!(hashes.len(), 8);
    // the stale partial document was replaced by fix or skipped as duplicate
    let doc = h.store.find_by_hash(Collection::Confirmed, "4-0").await.unwrap().unwrap();
    assert_eq!(doc["blk"]["i"], 4);
}

#[tokio::test]
async fn fresh_start_creates_indexes() {
    let chain = MockChain::with_blocks(1..=1, 1);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());
    h.engine.bootstrap().await.unwrap();
    assert!(h.store.index_spec(Collection::Confirmed).is_some());
    assert_eq!(h.engine.state(), SyncState::MempoolResync);
}

#[tokio::test]
async fn reset_clears_everything() {
    let chain = MockChain::with_blocks(1..=2, 2);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());
    h.chain.set_mempool(&["m"]);
    h.engine.bootstrap().await.unwrap();

    h.engine.reset().await.unwrap();
    assert_eq!(h.store.count(Collection::Confirmed).await.unwrap(), 0);
    assert_eq!(h.store.count(Collection::Unconfirmed).await.unwrap(), 0);
    assert_eq!(h.engine.tip().await.unwrap(), 0);
}

// ─── Mempool ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn mempool_full_resync_replaces_snapshot() {
    let chain = MockChain::with_blocks(0..0, 0);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());

    h.chain.set_mempool(&["a", "b", "c"]);
    assert_eq!(h.engine.resync_mempool().await.unwrap(), 3);
    h.chain.set_mempool(&["d", "e"]);
    assert_eq!(h.engine.resync_mempool().await.unwrap(), 2);

    let hashes: HashSet<_> = h.store.hashes(Collection::Unconfirmed).await.unwrap().into_iter().collect();
    assert_eq!(hashes, HashSet::from(["d".to_string(), "e".to_string()]));
}

#[tokio::test]
async fn duplicate_mempool_tx_is_not_republished() {
    let chain = MockChain::with_blocks(0..0, 0);
    let mut h = harness(chain, 0, 4, FilterEngine::pass_through());

    assert!(h.engine.ingest_mempool_tx("m1").await.unwrap());
    assert!(!h.engine.ingest_mempool_tx("m1").await.unwrap());
    assert!(matches!(h.events.try_recv().unwrap(), PublishedEvent::Mempool(_)));
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn live_mempool_fetches_stay_within_m() {
    let chain = MockChain::with_blocks(0..0, 0);
    *chain.fetch_delay.lock().unwrap() = Duration::from_millis(30);
    let config = SyncConfigBuilder::new()
        .mempool_concurrency(2)
        .fallback_interval_ms(60_000)
        .build_config();
    let h = harness_with(chain, config, FilterEngine::pass_through());

    let (notifications, notify) = ChannelNotifications::new();
    let (stop_tx, task) = spawn_listen(&h.engine, notifications);
    for i in 0..6 {
        notify.send(Notification::MempoolTx(format!("live-{i}"))).unwrap();
    }

    let store = h.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move { store.count(Collection::Unconfirmed).await.unwrap() == 6 }
    })
    .await;
    let max = h.chain.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 2, "saw {max} mempool fetches in flight");
    assert_eq!(max, 2);

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

// ─── Listening ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn listen_handles_notifications_until_shutdown() {
    let chain = MockChain::with_blocks(1..=2, 1);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());
    let (notifications, notify) = ChannelNotifications::new();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let engine = h.engine.clone();
    let task = tokio::spawn(async move {
        engine
            .start(&notifications, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let store = h.store.clone();
    wait_for(|| {
        let store = store.clone();
        async move { store.count(Collection::Confirmed).await.unwrap() == 2 }
    })
    .await;

    notify.send(Notification::MempoolTx("live-1".into())).unwrap();
    wait_for(|| {
        let store = store.clone();
        async move { store.count(Collection::Unconfirmed).await.unwrap() == 1 }
    })
    .await;

    h.chain.push_block(3, 1);
    notify.send(Notification::Block).unwrap();
    let engine = h.engine.clone();
    wait_for(|| {
        let engine = engine.clone();
        async move { engine.tip().await.unwrap() == 3 }
    })
    .await;

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(h.engine.state(), SyncState::Stopped);
}

#[tokio::test]
async fn fatal_error_in_triggered_sync_stops_listening() {
    let chain = MockChain::with_blocks(1..=1, 1);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());
    h.engine.bootstrap().await.unwrap();

    let (notifications, notify) = ChannelNotifications::new();
    h.chain.fail_height.store(true, Ordering::SeqCst);
    notify.send(Notification::Block).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.engine.clone().listen(&notifications, std::future::pending::<()>()),
    )
    .await
    .expect("listen should stop on its own");
    assert!(result.unwrap_err().is_rpc());
    assert_eq!(h.engine.state(), SyncState::Stopped);
}

#[tokio::test]
async fn fallback_timer_alone_drives_catch_up() {
    let chain = MockChain::with_blocks(1..=1, 1);
    let config = SyncConfigBuilder::new().fallback_interval_ms(50).build_config();
    let h = harness_with(chain, config, FilterEngine::pass_through());
    h.engine.bootstrap().await.unwrap();
    assert_eq!(h.engine.tip().await.unwrap(), 1);

    // the sender stays alive so the stream never ends, and nothing is sent
    let (notifications, _notify) = ChannelNotifications::new();
    let (stop_tx, task) = spawn_listen(&h.engine, notifications);
    h.chain.push_block(2, 1);
    h.chain.push_block(3, 1);

    let engine = h.engine.clone();
    wait_for(|| {
        let engine = engine.clone();
        async move { engine.tip().await.unwrap() == 3 }
    })
    .await;
    assert_eq!(confirmed_hashes(&h.store).await, vec!["1-0", "2-0", "3-0"]);

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_running_catch_up() {
    let chain = MockChain::with_blocks(1..=1, 1);
    let h = harness(chain, 0, 4, FilterEngine::pass_through());
    h.engine.bootstrap().await.unwrap();

    for height in 2..=20 {
        h.chain.push_block(height, 1);
    }
    *h.chain.fetch_delay.lock().unwrap() = Duration::from_millis(20);

    let (notifications, notify) = ChannelNotifications::new();
    let (stop_tx, task) = spawn_listen(&h.engine, notifications);
    notify.send(Notification::Block).unwrap();

    let engine = h.engine.clone();
    wait_for(|| {
        let engine = engine.clone();
        async move { engine.tip().await.unwrap() >= 2 }
    })
    .await;
    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(h.engine.state(), SyncState::Stopped);

    let tip = h.engine.tip().await.unwrap();
    let count = h.store.count(Collection::Confirmed).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // nothing keeps writing once listen has returned
    assert_eq!(h.engine.tip().await.unwrap(), tip);
    assert_eq!(h.store.count(Collection::Confirmed).await.unwrap(), count);
    assert_eq!(count, tip);
    assert!(tip < 20, "catch-up ran to {tip} after shutdown");
}
