mod api;
mod assets;
mod cell;
mod config;
mod correlator;
mod db;
mod indexer;
mod models;
mod notifier;
mod parser;
mod projector;
mod retry;
mod rpc;
mod scheduler;

#[cfg(test)]
mod testing;

use crate::assets::AssetTable;
use crate::correlator::{Correlator, CorrelatorConfig};
use crate::db::{SqliteStore, Store};
use crate::indexer::{TransactionProcessor, Walker, WalkerConfig};
use crate::notifier::{LogNotifier, Notifier, TelegramNotifier};
use crate::projector::{Projector, ProjectorConfig};
use crate::retry::RetryPolicy;
use crate::rpc::{ChainClient, TonApiClient};
use crate::scheduler::{job, ProjectionQueue, Scheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const POLL_LIMIT: usize = 50;
const PROJECTION_CONCURRENCY: usize = 8;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Lending Indexer starting...");

    let cfg = config::load()?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg.db_path)?);
    let chain: Arc<dyn ChainClient> = Arc::new(TonApiClient::new(&cfg.tonapi_url, cfg.tonapi_key.clone())?);
    let notifier: Arc<dyn Notifier> = match cfg.telegram.clone() {
        Some(telegram) => Arc::new(TelegramNotifier::new(telegram)?),
        None => {
            info!("Telegram not configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    let assets = Arc::new(AssetTable::mainnet());
    let projections = Arc::new(ProjectionQueue::new(store.clone(), cfg.settle_delay));

    let store_policy = RetryPolicy::linear(3, Duration::from_millis(200), Duration::from_secs(1));
    let rpc_policy = RetryPolicy::linear(5, Duration::from_secs(1), Duration::from_secs(5));

    let correlator = Arc::new(Correlator::new(
        CorrelatorConfig {
            mode: cfg.correlation_mode,
            orphan_after: cfg.orphan_after,
            evict_after: cfg.evict_after,
            poll_limit: POLL_LIMIT,
            fetch_policy: rpc_policy,
            store_policy,
        },
        store.clone(),
        chain.clone(),
        notifier.clone(),
        projections.clone(),
    ));
    correlator.load().await?;
    info!("Correlation mode: {:?}", correlator.mode());

    let walker = Arc::new(Walker::new(
        WalkerConfig {
            account: cfg.master_address,
            page_size: cfg.page_size,
            epoch_floor: cfg.epoch_floor,
            failure_threshold: cfg.fetch_failure_threshold,
            retry_delay: Duration::from_secs(1),
            failure_cooldown: Duration::from_secs(60),
        },
        chain.clone(),
        store.clone(),
        notifier.clone(),
        TransactionProcessor::new(correlator.clone(), notifier.clone(), assets.clone()),
    ));

    let projector = Arc::new(Projector::new(
        ProjectorConfig {
            rpc_policy,
            store_policy,
            concurrency: PROJECTION_CONCURRENCY,
        },
        store.clone(),
        chain.clone(),
        notifier.clone(),
        projections.clone(),
        assets.clone(),
    ));

    let mut scheduler = Scheduler::new();
    scheduler.add(
        "walker",
        cfg.walk_interval,
        job(move || {
            let walker = walker.clone();
            async move { walker.run_cycle().await.map(|_| ()) }
        }),
    );
    scheduler.add(
        "projector",
        cfg.project_interval,
        job(move || {
            let projector = projector.clone();
            async move { projector.drain().await.map(|_| ()) }
        }),
    );
    scheduler.add(
        "correlator",
        cfg.correlate_interval,
        job(move || {
            let correlator = correlator.clone();
            async move { correlator.run_cycle().await }
        }),
    );

    // Spawn API task
    let api_handle = tokio::spawn({
        let state = api::ApiState { store: store.clone() };
        let port = cfg.port;
        async move { api::serve(port, state).await }
    });

    // Spawn scheduler task
    let scheduler_handle = tokio::spawn(scheduler.run());

    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = scheduler_handle => match res {
            Ok(Ok(_)) => info!("Scheduler exited cleanly"),
            Ok(Err(e)) => error!("Scheduler error: {:?}", e),
            Err(e) => error!("Scheduler task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Lending Indexer stopped.");
    Ok(())
}
