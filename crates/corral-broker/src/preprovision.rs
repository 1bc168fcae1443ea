// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The pre-provisioning pool.
//!
//! A background loop keeps each plan's warm pool at its configured depth so
//! provision requests can claim a finished instance instead of waiting out a
//! cold create. Every five minutes the store computes the per-plan deficit
//! and hands back placeholder rows; each placeholder is provisioned for real,
//! one per minute, to avoid hammering backend rate limits. A placeholder
//! whose provision fails is hard-deleted so it never pollutes the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use corral_store::models::TaskAction;
use corral_store::{status, Storage};

use crate::providers::ProviderRegistry;

const OUTER_INTERVAL: Duration = Duration::from_secs(60 * 5);
const INNER_PAUSE: Duration = Duration::from_secs(60);

/// One top-up pass over every plan's warm pool.
pub async fn run_preprovision_tasks(
    storage: &Storage,
    registry: &ProviderRegistry,
    pause: Duration,
) {
    let entries = match storage.start_provisioning_tasks().await {
        Ok(entries) => entries,
        Err(err) => {
            error!(error = %err, "computing preprovision deficit failed");
            return;
        }
    };

    for entry in entries {
        info!(id = %entry.id, plan = %entry.plan_id, "starting preprovisioning database");

        let plan = match storage.get_plan_by_id(&entry.plan_id).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(plan = %entry.plan_id, error = %err, "unable to preprovision, cannot find plan");
                let _ = storage.nuke_instance(&entry.id).await;
                continue;
            }
        };
        let provider = match registry.provider_for_plan(&plan).await {
            Ok(provider) => provider,
            Err(err) => {
                error!(plan = %plan.id, error = %err, "unable to preprovision, cannot find provider");
                let _ = storage.nuke_instance(&entry.id).await;
                continue;
            }
        };

        let instance = match provider.provision(&entry.id, &plan, "preprovisioned").await {
            Ok(instance) => instance,
            Err(err) => {
                error!(plan = %plan.id, error = %err, "error preprovisioning database");
                let _ = storage.nuke_instance(&entry.id).await;
                continue;
            }
        };

        if let Err(err) = storage.update_instance(&instance, &plan.id).await {
            error!(
                id = %instance.id,
                instance = %instance.name,
                error = %err,
                "error promoting preprovisioned placeholder"
            );
            if let Err(deprovision_err) = provider.deprovision(&instance, false).await {
                error!(
                    instance = %instance.name,
                    error = %deprovision_err,
                    "cleanup deprovision failed after promotion failure"
                );
                if let Err(task_err) = storage
                    .add_task(&instance.id, TaskAction::Delete, &instance.name)
                    .await
                {
                    error!(
                        instance = %instance.name,
                        error = %task_err,
                        "ORPHAN: unable to schedule deletion of unrecorded preprovisioned instance"
                    );
                }
            }
            continue;
        }

        if !status::is_available(&instance.status) {
            if let Err(err) = storage
                .add_task(&instance.id, TaskAction::ResyncUntilAvailable, "")
                .await
            {
                error!(instance = %instance.name, error = %err, "unable to schedule resync from provider");
            }
        }

        info!(id = %entry.id, plan = %entry.plan_id, "finished preprovisioning database");
        tokio::time::sleep(pause).await;
    }
}

/// Run the pre-provision loop until shutdown.
pub async fn run_preprovision_loop(
    storage: Arc<Storage>,
    registry: Arc<ProviderRegistry>,
    shutdown: Arc<Notify>,
) {
    info!("preprovision loop started");
    loop {
        run_preprovision_tasks(&storage, &registry, INNER_PAUSE).await;
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                info!("preprovision loop received shutdown signal");
                break;
            }

            _ = tokio::time::sleep(OUTER_INTERVAL) => {}
        }
    }
    info!("preprovision loop stopped");
}
