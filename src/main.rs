mod brain;
mod cli;
mod config;
mod errors;
mod gateway;
mod journal;
mod permissions;
mod provider;
mod storage;
mod tools;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use brain::BrainRuntime;
use config::AppConfig;
use gateway::GatewayState;
use journal::Journal;
use permissions::PermissionBroker;
use storage::Storage;
use tools::cloud_request::CloudRequestTool;
use tools::device_api::DeviceApiProxy;
use tools::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,methings_core=debug".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = cli::Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path)?;
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }
    if let Some(port) = cli.port {
        config.bind_port = port;
    }

    std::fs::create_dir_all(&config.base_dir)
        .with_context(|| format!("creating base dir {}", config.base_dir.display()))?;
    std::fs::create_dir_all(config.user_root())
        .with_context(|| format!("creating workspace root {}", config.user_root().display()))?;

    let storage = Storage::open(config.db_path())?;
    let broker = PermissionBroker::new(storage.clone());
    let device_api = Arc::new(DeviceApiProxy::new(config.device_api_url.clone(), broker.clone()));
    let cloud_request = Arc::new(CloudRequestTool::new(config.cloud_request_url.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        storage.clone(),
        broker.clone(),
        device_api,
        cloud_request,
        config.user_root(),
    ));
    let journal = Journal::new(storage.clone());
    let brain = Arc::new(BrainRuntime::new(
        storage.clone(),
        journal.clone(),
        dispatcher.clone(),
        broker.clone(),
        config.user_root(),
    ));
    brain.maybe_autostart();

    let state = GatewayState::new(storage, broker, dispatcher, journal, brain);
    let router = gateway::build_router(state);

    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("methings listening on {addr}");
    axum::serve(listener, router).await.context("serving gateway")?;
    Ok(())
}
