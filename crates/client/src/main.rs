//! Headless sync agent.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tillsync_client::{
    AssetCache, AssetStore, ClientConfig, ConnectivityMonitor, HttpFetcher, HttpProbe,
    HttpRemoteStore, LocalStore, SyncEngine, SyncEvent, SyncWorker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("invalid TILLSYNC_* configuration")?;
    tillsync_observability::init(config.log_format);

    tracing::info!(
        api_url = %config.api_url,
        data_dir = %config.data_dir.display(),
        "starting tillsync"
    );

    let store = LocalStore::open(config.store_path())
        .await
        .with_context(|| format!("failed to open local store at {:?}", config.store_path()))?
        .with_max_pending(config.max_pending);

    let remote = HttpRemoteStore::new(config.api_url.clone(), config.remote_timeout)
        .context("failed to build the remote store client")?
        .with_token(config.auth_token.clone());
    let probe = HttpProbe::new(config.health_url(), config.connectivity.probe_timeout)
        .context("failed to build the health probe client")?;
    let monitor = ConnectivityMonitor::start(Arc::new(probe), config.connectivity.clone()).await;

    let engine = Arc::new(
        SyncEngine::new(store, Arc::new(remote), monitor.clone())
            .with_retry_policy(config.retry.clone())
            .with_remote_timeout(config.remote_timeout)
            .with_retention(config.retention),
    );

    let pending = engine.pending_count().await.context("failed to read the mutation queue")?;
    tracing::info!(pending, online = monitor.is_online(), "local queue loaded");

    let asset_store = AssetStore::open(config.asset_cache_path())
        .await
        .with_context(|| format!("failed to open asset cache at {:?}", config.asset_cache_path()))?;
    let assets = AssetCache::new(asset_store, Arc::new(HttpFetcher::default()), config.remote_timeout)
        .await
        .context("failed to initialize asset cache")?;
    if let Err(err) = assets.install(&config.cache_generation, &config.shell_urls).await {
        tracing::warn!(error = %err, generation = %config.cache_generation, "asset cache install failed");
    }

    let worker = SyncWorker::new(engine.clone(), config.drain_interval).start();
    let mut events = worker.subscribe();
    let log_events = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::MutationsStuck { ids }) => {
                    tracing::warn!(count = ids.len(), "mutations need manual attention")
                }
                Ok(SyncEvent::DrainFailed { error }) => tracing::error!(%error, "drain failed"),
                Ok(event) => tracing::debug!(?event, "sync event"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "sync events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    worker.shutdown().await;
    log_events.abort();
    assets.flush_pending_writes().await;
    engine.store().close().await;

    tracing::info!("tillsync stopped");
    Ok(())
}
