mod api;
mod backoff;
mod config;
mod error;
mod finalize;
mod manager;
mod monitor;
mod provider;
mod resolver;
mod store;
#[cfg(test)]
mod testutil;
mod tokens;

use std::sync::Arc;

use anyhow::Context;
use panrelay_core::{AuthClient, PanClient};

use crate::api::AppState;
use crate::config::DaemonConfig;
use crate::manager::TaskManager;
use crate::monitor::Monitor;
use crate::provider::{CloudProvider, PanProvider};
use crate::store::TaskStore;
use crate::tokens::TokenManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::from_env();

    let store = Arc::new(match &config.database_url {
        Some(url) => TaskStore::new(url)
            .await
            .with_context(|| format!("failed to open task store at {url}"))?,
        None => TaskStore::new_default()
            .await
            .context("failed to open default task store")?,
    });

    let auth = match &config.api_base_url {
        Some(base) => AuthClient::with_base_url(base)?,
        None => AuthClient::new()?,
    };
    let client = match &config.api_base_url {
        Some(base) => PanClient::with_base_url(base)?,
        None => PanClient::new()?,
    };
    let tokens = TokenManager::new(
        auth,
        store.clone(),
        config.credentials.clone(),
        config.token_refresh_skew,
    );
    let provider: Arc<dyn CloudProvider> =
        Arc::new(PanProvider::new(client, tokens, config.list_limit));

    let manager = TaskManager::new(store.clone(), provider.clone(), config.root_dir_id);
    let monitor = Monitor::new(
        store,
        provider,
        config.poll_interval,
        config.download_timeout,
    );
    monitor.start();

    let app = api::router(Arc::new(AppState { manager }));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        poll_secs = config.poll_interval.as_secs(),
        "panrelayd listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("shutting down, waiting for monitor cycles");
    monitor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
