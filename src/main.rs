#![allow(missing_docs)]

//! Straylight gateway binary.
//!
//! Wires the credential plane together: datastore, credential cache, OAuth
//! exchanger, refresh coordinator, instance manager, auth gate, and the
//! background maintenance loop. The tool-call transport and the
//! per-integration adapters mount on top of these components.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use straylight::cache::CredentialCache;
use straylight::config::GatewayConfig;
use straylight::instances::InstanceManager;
use straylight::maintenance::MaintenanceLoop;
use straylight::oauth::HttpExchanger;
use straylight::pipeline::AuthGate;
use straylight::refresh::RefreshCoordinator;
use straylight::store::Store;

#[derive(Parser)]
#[command(name = "straylight", about = "Integration gateway credential plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway service.
    Start,
    /// Load and print the effective configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Optional .env for local development; ignored when absent.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match cli.command {
        Command::Start => start().await,
        Command::CheckConfig => check_config(),
    }
}

async fn start() -> Result<()> {
    let config = GatewayConfig::load().context("failed to load configuration")?;
    let _logging_guard = straylight::logging::init_production(Path::new(&config.paths.logs_dir))
        .context("failed to initialise logging")?;

    info!("straylight starting");

    let store = Store::open(&config.database.url)
        .await
        .context("failed to open datastore")?;
    let cache = Arc::new(CredentialCache::new(
        config.cache.capacity,
        config.cache.shards,
    ));
    let exchanger = Arc::new(
        HttpExchanger::new(config.oauth.service_url.clone(), config.oauth_timeout())
            .context("failed to build OAuth client")?,
    );

    let coordinator = RefreshCoordinator::new(
        store.clone(),
        Arc::clone(&cache),
        exchanger.clone(),
        config.singleflight_timeout(),
        config.expiry_skew(),
    );
    let _manager = Arc::new(InstanceManager::new(
        store.clone(),
        Arc::clone(&cache),
        exchanger,
    ));
    let _gate = Arc::new(AuthGate::new(
        store.clone(),
        Arc::clone(&cache),
        Arc::clone(&coordinator),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = MaintenanceLoop::new(store, Arc::clone(&cache), &config);
    let maintenance_handle = tokio::spawn(maintenance.run(shutdown_rx));

    info!("straylight ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = maintenance_handle.await;

    info!("straylight stopped");
    Ok(())
}

fn check_config() -> Result<()> {
    straylight::logging::init_cli();
    let config = GatewayConfig::load().context("failed to load configuration")?;
    // GatewayConfig carries no secret material; the OAuth client pair and
    // tokens live in the datastore, never in config.
    println!("{config:#?}");
    Ok(())
}
