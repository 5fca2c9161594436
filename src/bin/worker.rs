//! Chatstream Worker - Event Processing Engine
//!
//! Registers one consumer group per stream, then runs one consumer loop per
//! stream until SIGTERM / Ctrl+C.
//!
//! ## Configuration
//!
//! - `CHATSTREAM_CONFIG`: path of the TOML config (default: `config/chatstream.toml`)
//! - `CHATSTREAM_WORKER_NAME`: Unique worker identifier (default: hostname or UUID)
//! - `RUST_LOG`: Logging level (default: "info")

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chatstream::config::ChatstreamConfig;
use chatstream::consumer::{BatchReport, Consumer};
use chatstream::event::{all_streams, Event, SearchSync};
use chatstream::handlers::HandlerContext;
use chatstream::lock::LockManager;
use chatstream::multiplexer::Multiplexer;
use chatstream::producer::Producer;
use chatstream::registrar::Registrar;
use chatstream::repository::RedisRepository;
use chatstream::router::Router;
use chatstream::search::{HttpSearchIndex, MemorySearchIndex, SearchIndex};
use chatstream::shutdown::ShutdownSignal;
use chatstream::store::RedisStore;

/// Build the search index from configuration, or a recording stand-in.
fn build_search(config: &ChatstreamConfig) -> Arc<dyn SearchIndex> {
    match config.usable_search() {
        Some(search) => {
            info!(url = %search.url, index = %search.index, alias = %search.alias, "Search index configured");
            Arc::new(
                HttpSearchIndex::new(&search.url, &search.index, &search.alias)
                    .with_timeout(search.timeout())
                    .with_retries(search.retries),
            )
        }
        None => {
            warn!("No search service configured, search-sync entries will not reach an index");
            Arc::new(MemorySearchIndex::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    dotenvy::dotenv().ok();

    // Get configuration
    let config = ChatstreamConfig::load()?;
    let worker_name = config.worker.resolve_name();
    let consumer_group = config.worker.consumer_group.clone();

    info!(
        worker_name = %worker_name,
        consumer_group = %consumer_group,
        "Chatstream Worker starting"
    );

    // Create Redis connection pool and make sure it is reachable
    let store = RedisStore::from_url(&config.redis.url)?;
    store.ping().await?;

    let streams_store = Arc::new(store.clone());
    let locks = LockManager::new(streams_store.clone());
    let producer = Producer::new(streams_store.clone()).with_max_len(config.streams.max_len);

    // Register consumer groups; anything but "already exists" aborts boot
    let registrar = Registrar::new(streams_store.clone(), locks.clone());
    for stream in all_streams() {
        let registration = registrar.init_group(stream, &consumer_group).await?;
        info!(
            stream = %stream,
            consumer_group = %consumer_group,
            registration = ?registration,
            "Consumer group ready"
        );
    }

    let search_configured = config.usable_search().is_some();
    let ctx = HandlerContext {
        repository: Arc::new(RedisRepository::new(store.pool().clone())),
        search: build_search(&config),
        producer: producer.clone(),
        locks,
        multiplexer: Multiplexer::new(),
    };
    let router = Router::new(ctx);

    // Bootstrap runs under a lock, so every worker may ask for it
    if search_configured {
        let id = producer.publish(&Event::SearchSync(SearchSync::init())).await?;
        info!(id = %id, "Search bootstrap requested");
    }

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    let mut consumers = JoinSet::new();

    for stream in all_streams() {
        let consumer = Consumer::new(
            streams_store.clone(),
            router.clone(),
            stream,
            consumer_group.clone(),
            worker_name.clone(),
        )
        .with_batch_size(config.worker.batch_size)
        .with_block(config.worker.block())
        .with_error_backoff(config.worker.error_backoff())
        .with_claim_idle(config.worker.claim_idle())
        .with_claim_interval(config.worker.claim_interval());

        let shutdown = shutdown.clone();
        consumers.spawn(async move { consumer.run(shutdown).await });
    }

    info!(consumers = consumers.len(), "Listening for entries");

    shutdown.wait().await;
    info!("Shutdown signal received, finishing current batches...");

    let mut totals = BatchReport::default();
    let drained = tokio::time::timeout(shutdown.timeout(), async {
        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok(report) => {
                    totals.read += report.read;
                    totals.handled += report.handled;
                    totals.failed += report.failed;
                    totals.acked += report.acked;
                }
                Err(e) => error!(error = %e, "Consumer task failed"),
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            timeout_secs = shutdown.timeout().as_secs(),
            "Consumers did not stop in time, aborting"
        );
        consumers.abort_all();
    }

    info!(
        entries_handled = totals.handled,
        entries_failed = totals.failed,
        "Worker shutdown complete"
    );
    Ok(())
}
