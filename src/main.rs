mod api;
mod auth;
mod cache;
mod commander;
mod config;
mod download;
mod error;
mod freshness;
mod ingest;
mod models;
mod refresh;
mod store;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use cache::SystemCache;
use commander::CommanderClient;
use config::Config;
use download::HttpBulkSource;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub cache: Arc<SystemCache<HttpBulkSource>>,
    pub commander: Arc<CommanderClient>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ed_systems_cache=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    download::ensure_data_dir(&config.data_dir).await?;
    if config.api_key_is_fallback {
        warn!("Using a generated API key; protected routes are effectively closed");
    }

    let source = HttpBulkSource::new(config.bulk_url.clone(), config.download_timeout)?;
    let cache = SystemCache::open(config.cache_config(), source)
        .await
        .with_context(|| format!("Failed opening systems cache in {}", config.data_dir.display()))?;
    let commander = CommanderClient::new(
        config.cmdr_name.clone(),
        config.edsm_api_key.clone(),
        config.inara_api_key.clone(),
        config.lookup_timeout,
    )?;

    let state = AppState {
        config: config.clone(),
        cache: Arc::new(cache),
        commander: Arc::new(commander),
    };

    worker::spawn_refresh_worker(state.clone());

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        data_dir = %config.data_dir.display(),
        refresh_interval_hours = config.refresh_interval_hours,
        "ed-systems-cache listening on {}",
        config.bind_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
