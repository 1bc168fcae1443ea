// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Corral broker background engine.
//!
//! Runs the store bootstrap, the task worker, and the pre-provision loop.
//! The OSB HTTP transport is a separate concern layered on
//! [`corral_broker::BusinessLogic`].

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{error, info};

use corral_broker::config::Config;
use corral_broker::logic::BusinessLogic;
use corral_broker::{preprovision, tasks};
use corral_store::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from the working directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("corral_broker=info".parse().unwrap())
                .add_directive("corral_store=info".parse().unwrap()),
        )
        .init();

    info!("Starting Corral broker");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(name_prefix = %config.name_prefix, "Configuration loaded");

    info!("Connecting to database...");
    let storage = Arc::new(Storage::connect(&config.database_url).await?);
    info!("Database connection established, migrations applied");

    let logic = BusinessLogic::new(storage.clone(), &config.name_prefix);
    let registry = logic.registry();

    let worker_shutdown = Arc::new(Notify::new());
    let preprovision_shutdown = Arc::new(Notify::new());

    let worker_ctx = tasks::WorkerContext {
        storage: storage.clone(),
        registry: registry.clone(),
        retry_webhooks: config.retry_webhooks,
        http: reqwest::Client::new(),
    };
    let worker_signal = worker_shutdown.clone();
    let worker = tokio::spawn(async move {
        tasks::run_worker_tasks(worker_ctx, worker_signal).await;
    });

    let preprovision_storage = storage.clone();
    let preprovision_signal = preprovision_shutdown.clone();
    let preprovisioner = tokio::spawn(async move {
        preprovision::run_preprovision_loop(preprovision_storage, registry, preprovision_signal)
            .await;
    });

    info!("Corral broker initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    // notify_one leaves a permit behind, so a loop that is mid-iteration
    // still sees the shutdown on its next select.
    worker_shutdown.notify_one();
    preprovision_shutdown.notify_one();
    let _ = tokio::join!(worker, preprovisioner);

    storage.close().await;
    info!("Shutdown complete");

    Ok(())
}
