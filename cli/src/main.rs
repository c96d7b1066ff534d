//! bitsync CLI — Bitcoin block and mempool sync daemon.
//!
//! # Commands
//! ```text
//! bitsync run                 catch up, resync the mempool, then follow the node
//! bitsync fix [HEIGHT]        re-crawl HEIGHT (default: tip) and rewind to it
//! bitsync reset               clear both collections and the tip
//! bitsync index               (re)create the configured indexes
//! bitsync info                print the effective configuration
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use bitsync_bitcoin::{BitcoindRpc, RedisNotifications, RedisPublisher, SyncEngine};
use bitsync_core::notify::ChannelNotifications;
use bitsync_core::{
    BroadcastPublisher, EventPublisher, FilterEngine, FilterSpec, NotificationSource,
    TransformRegistry,
};
use bitsync_storage::SqliteStorage;

mod config;
mod logging;

use config::{AppConfig, MEMORY_PATH};

#[derive(Parser)]
#[command(
    name = "bitsync",
    about = "Sync Bitcoin blocks and mempool transactions into a queryable store",
    long_about = "
bitsync: crawl a bitcoind node, filter transactions, store them, and publish
each accepted block and mempool transaction.

ENVIRONMENT VARIABLES:
  BITSYNC_RPC_PASSWORD   bitcoind RPC password (overrides rpc.password)
  RUST_LOG               log filter (overrides the log section)
",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON filter file; its `from` is the genesis height
    #[arg(short, long, global = true)]
    filter: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync daemon until Ctrl-C or a fatal error
    Run,
    /// Re-crawl one block and rewind the tip to it
    Fix {
        /// Block height (default: the current tip)
        height: Option<u64>,
    },
    /// Delete all records and the tip
    Reset,
    /// Create the configured indexes
    Index,
    /// Print the effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    logging::init_tracing(&config.log);

    let spec = load_filter(cli.filter.as_deref())?;

    match cli.command {
        Commands::Run => cmd_run(&config, spec.as_ref()).await,
        Commands::Fix { height } => {
            let engine = build_engine(&config, spec.as_ref(), admin_publisher()).await?;
            let result = engine.fix(height).await;
            close(&engine).await;
            let fixed = result.context("fix failed")?;
            println!("fixed block {fixed}, tip is now {fixed}");
            Ok(())
        }
        Commands::Reset => {
            let engine = build_engine(&config, spec.as_ref(), admin_publisher()).await?;
            let result = engine.reset().await;
            close(&engine).await;
            result.context("reset failed")?;
            println!("index reset");
            Ok(())
        }
        Commands::Index => {
            let engine = build_engine(&config, spec.as_ref(), admin_publisher()).await?;
            let result = engine.reindex().await;
            close(&engine).await;
            result.context("index creation failed")?;
            println!("indexes created");
            Ok(())
        }
        Commands::Info => cmd_info(&config, spec.as_ref()),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(config: &AppConfig, spec: Option<&FilterSpec>) -> Result<()> {
    // local channel ends kept open while running without redis
    let mut _idle = None;
    let (publisher, notifications): (Arc<dyn EventPublisher>, Box<dyn NotificationSource>) =
        match &config.redis {
            Some(redis) => {
                let publisher = RedisPublisher::connect(&redis.url, redis.prefix.clone())
                    .await
                    .context("connecting redis publisher")?;
                let notifications = RedisNotifications::with_channels(
                    &redis.url,
                    redis.tx_channel.clone(),
                    redis.block_channel.clone(),
                )?;
                (Arc::new(publisher), Box::new(notifications))
            }
            None => {
                info!("no redis section, relying on the fallback timer");
                let (publisher, events) = BroadcastPublisher::new(1024);
                let (notifications, sender) = ChannelNotifications::new();
                _idle = Some((events, sender));
                (Arc::new(publisher), Box::new(notifications))
            }
        };

    let engine = build_engine(config, spec, publisher).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let result = engine.clone().start(notifications.as_ref(), shutdown).await;
    close(&engine).await;
    result.context("sync stopped")
}

fn cmd_info(config: &AppConfig, spec: Option<&FilterSpec>) -> Result<()> {
    println!("bitsync {}", env!("CARGO_PKG_VERSION"));
    println!();
    print!("{}", serde_yaml::to_string(&config.redacted())?);
    match spec {
        Some(spec) => {
            println!();
            println!("filter:");
            println!("{}", serde_json::to_string_pretty(spec)?);
        }
        None => println!("\nfilter: none (pass-through)"),
    }
    println!();
    println!("effective genesis: {}", config.sync_config(spec).genesis);
    Ok(())
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

fn load_filter(path: Option<&Path>) -> Result<Option<FilterSpec>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading filter {}", path.display()))?;
    let spec = FilterSpec::from_json(&text)
        .with_context(|| format!("parsing filter {}", path.display()))?;
    Ok(Some(spec))
}

fn admin_publisher() -> Arc<dyn EventPublisher> {
    let (publisher, _) = BroadcastPublisher::new(16);
    Arc::new(publisher)
}

async fn build_engine(
    config: &AppConfig,
    spec: Option<&FilterSpec>,
    publisher: Arc<dyn EventPublisher>,
) -> Result<Arc<SyncEngine>> {
    let filter = match spec {
        Some(spec) => FilterEngine::compile(spec, &TransformRegistry::with_builtins())
            .context("compiling filter")?,
        None => FilterEngine::pass_through(),
    };

    let store = if config.storage.path == MEMORY_PATH {
        SqliteStorage::in_memory().await
    } else {
        SqliteStorage::open(&config.storage.path).await
    };
    let store = Arc::new(store.with_context(|| format!("opening {}", config.storage.path))?);
    let rpc = Arc::new(BitcoindRpc::new(config.rpc.clone()).context("creating rpc client")?);

    let sync = config.sync_config(spec);
    info!(
        rpc = %config.rpc.url,
        storage = %config.storage.path,
        genesis = sync.genesis,
        concurrency = sync.rpc_concurrency,
        "engine configured"
    );
    Ok(Arc::new(SyncEngine::new(
        sync,
        rpc,
        store.clone(),
        store,
        filter,
        publisher,
    )))
}

async fn close(engine: &SyncEngine) {
    if let Err(e) = engine.close().await {
        warn!(error = %e, "closing store failed");
    }
}
