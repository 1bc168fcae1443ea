// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The asynchronous task engine.
//!
//! A single worker loop pops one pending task per 60-second tick and runs it
//! to completion. Transient failures increment the retry counter and put the
//! task back to pending; a task that exhausts its cap is marked failed with a
//! descriptive result. Deletes cap at 10 retries, everything else at 60.
//!
//! The worker never takes the controller's mutex; `pop_pending_task`'s atomic
//! pending -> started transition is what guarantees at-most-one worker per
//! task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use corral_store::models::{Instance, Task, TaskAction};
use corral_store::Storage;

use crate::logic::{resolve_instance, resolve_replica};
use crate::providers::{compose_url, ProviderError, ProviderRegistry};
use crate::webhook;

const TICK: Duration = Duration::from_secs(60);
const DELETE_RETRY_CAP: i64 = 10;
const DEFAULT_RETRY_CAP: i64 = 60;
/// Cross-provider migration polls the target this many times, 30 s apart.
const MIGRATION_POLLS: usize = 60;
const MIGRATION_POLL_PAUSE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMetadata {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeProvidersMetadata {
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlansMetadata {
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreMetadata {
    pub backup: String,
}

/// Everything a worker needs to execute tasks.
#[derive(Clone)]
pub struct WorkerContext {
    pub storage: Arc<Storage>,
    pub registry: Arc<ProviderRegistry>,
    pub retry_webhooks: bool,
    pub http: reqwest::Client,
}

async fn finish_task(storage: &Storage, task_id: &str, retries: i64, result: &str, status: &str) {
    if let Err(err) = storage
        .update_task(
            task_id,
            Some(status),
            Some(retries),
            None,
            Some(result),
            None,
            Some(Utc::now()),
        )
        .await
    {
        error!(task = %task_id, error = %err, retries, result, status, "unable to update task");
    }
}

async fn requeue_task(storage: &Storage, task_id: &str, retries: i64, result: &str) {
    if let Err(err) = storage
        .update_task(task_id, Some("pending"), Some(retries), None, Some(result), None, None)
        .await
    {
        error!(task = %task_id, error = %err, retries, result, "unable to requeue task");
    }
}

/// True when the retry cap is hit; marks the task failed as a side effect.
async fn exhausted(storage: &Storage, task: &Task, cap: i64, what: &str) -> bool {
    if task.retries < cap {
        return false;
    }
    info!(task = %task.id, retries = task.retries, "retry limit was reached for task");
    finish_task(
        storage,
        &task.id,
        task.retries,
        &format!(
            "Unable to {what} {} as it failed multiple times ({})",
            task.database_id, task.result
        ),
        "failed",
    )
    .await;
    true
}

/// Run the worker loop until shutdown.
pub async fn run_worker_tasks(ctx: WorkerContext, shutdown: Arc<Notify>) {
    info!("task worker started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                info!("task worker received shutdown signal");
                break;
            }

            _ = tokio::time::sleep(TICK) => {
                ctx.storage.warn_on_unfinished_tasks().await;
                match ctx.storage.pop_pending_task().await {
                    Ok(Some(task)) => {
                        info!(task = %task.id, action = task.action.as_str(), "started task");
                        process_task(&ctx, task).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(error = %err, "getting a pending task failed");
                    }
                }
            }
        }
    }
    info!("task worker stopped");
}

/// Execute one popped task to a terminal or requeued state.
pub async fn process_task(ctx: &WorkerContext, task: Task) {
    match task.action {
        TaskAction::Delete => handle_delete(ctx, &task).await,
        TaskAction::ResyncFromProvider => handle_resync(ctx, &task).await,
        TaskAction::ResyncUntilAvailable => handle_resync_until_available(ctx, &task).await,
        TaskAction::ResyncReplicasFromProvider => handle_resync_replicas(ctx, &task).await,
        TaskAction::PerformPostProvision => handle_post_provision(ctx, &task).await,
        TaskAction::NotifyCreateServiceWebhook => handle_notify_create(ctx, &task).await,
        TaskAction::NotifyCreateBindingWebhook => {
            // Recognized for wire compatibility, never dispatched with a
            // real handler.
            finish_task(&ctx.storage, &task.id, task.retries, "not implemented", "failed").await;
        }
        TaskAction::ChangePlans => handle_change_plans(ctx, &task).await,
        TaskAction::ChangeProviders => handle_change_providers(ctx, &task).await,
        TaskAction::RestoreDatabase => handle_restore(ctx, &task).await,
    }
    info!(task = %task.id, "finished processing task");
}

async fn handle_delete(ctx: &WorkerContext, task: &Task) {
    if exhausted(&ctx.storage, task, DELETE_RETRY_CAP, "delete database").await {
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    let provider = match ctx.registry.provider_for_plan(&instance.plan).await {
        Ok(provider) => provider,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get provider: {e}")).await;
            return;
        }
    };
    let replicas = match ctx.storage.has_replicas(&instance).await {
        Ok(count) => count,
        Err(e) => {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Failed to check for replicas: {e}"),
            )
            .await;
            return;
        }
    };
    if replicas > 0 {
        if let Err(e) = provider.delete_read_replica(&instance).await {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Failed to remove replicas: {e}"),
            )
            .await;
            return;
        }
    }
    if let Err(e) = provider.deprovision(&instance, true).await {
        requeue_task(&ctx.storage, &task.id, retries, &format!("Failed to deprovision: {e}")).await;
        return;
    }
    if let Err(e) = ctx.storage.delete_instance(&instance.id).await {
        requeue_task(&ctx.storage, &task.id, retries, &format!("Failed to delete: {e}")).await;
        return;
    }
    finish_task(&ctx.storage, &task.id, task.retries, "", "finished").await;
}

async fn handle_resync(ctx: &WorkerContext, task: &Task) {
    if exhausted(
        &ctx.storage,
        task,
        DEFAULT_RETRY_CAP,
        "resync information from provider for database",
    )
    .await
    {
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    let entry = match ctx.storage.get_instance(&task.database_id).await {
        Ok(entry) => entry,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get entry: {e}")).await;
            return;
        }
    };
    if instance.status == entry.status {
        requeue_task(&ctx.storage, &task.id, retries, "No change in status since last check").await;
        return;
    }
    let plan_id = instance.plan.id.clone();
    if let Err(e) = ctx.storage.update_instance(&instance, &plan_id).await {
        requeue_task(&ctx.storage, &task.id, retries, &format!("Failed to update instance: {e}"))
            .await;
        return;
    }
    finish_task(&ctx.storage, &task.id, task.retries, "", "finished").await;
}

async fn handle_resync_until_available(ctx: &WorkerContext, task: &Task) {
    if exhausted(
        &ctx.storage,
        task,
        DEFAULT_RETRY_CAP,
        "resync information from provider for database",
    )
    .await
    {
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    let plan_id = instance.plan.id.clone();
    if let Err(e) = ctx.storage.update_instance(&instance, &plan_id).await {
        requeue_task(&ctx.storage, &task.id, retries, &format!("Failed to update instance: {e}"))
            .await;
        return;
    }
    if !instance.is_available() {
        requeue_task(
            &ctx.storage,
            &task.id,
            retries,
            &format!("No change in status since last check ({})", instance.status),
        )
        .await;
        return;
    }
    finish_task(&ctx.storage, &task.id, task.retries, "", "finished").await;
}

async fn handle_resync_replicas(ctx: &WorkerContext, task: &Task) {
    if exhausted(
        &ctx.storage,
        task,
        DEFAULT_RETRY_CAP,
        "resync information from provider for replica",
    )
    .await
    {
        return;
    }
    let retries = task.retries + 1;

    let replica = match resolve_replica(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(replica) => replica,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get replica: {e}")).await;
            return;
        }
    };
    if let Err(e) = ctx.storage.update_replica(&task.database_id, &replica).await {
        requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot update replica: {e}")).await;
        return;
    }
    if !replica.is_available() {
        requeue_task(
            &ctx.storage,
            &task.id,
            retries,
            &format!("No change in status since last check ({})", replica.status),
        )
        .await;
        return;
    }
    finish_task(&ctx.storage, &task.id, task.retries, "", "finished").await;
}

async fn handle_post_provision(ctx: &WorkerContext, task: &Task) {
    if exhausted(
        &ctx.storage,
        task,
        DEFAULT_RETRY_CAP,
        "resync information from provider for database",
    )
    .await
    {
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    let plan_id = instance.plan.id.clone();
    if let Err(e) = ctx.storage.update_instance(&instance, &plan_id).await {
        requeue_task(&ctx.storage, &task.id, retries, &format!("Failed to update instance: {e}"))
            .await;
        return;
    }
    if !instance.is_available() {
        requeue_task(
            &ctx.storage,
            &task.id,
            retries,
            &format!("No change in status since last check ({})", instance.status),
        )
        .await;
        return;
    }

    let provider = match ctx.registry.provider_for_plan(&instance.plan).await {
        Ok(provider) => provider,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get provider: {e}")).await;
            return;
        }
    };
    let finished = match provider.perform_post_provision(&instance).await {
        Ok(finished) => finished,
        Err(e) => {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Failed to perform post provision: {e}"),
            )
            .await;
            return;
        }
    };
    let plan_id = finished.plan.id.clone();
    if let Err(e) = ctx.storage.update_instance(&finished, &plan_id).await {
        requeue_task(
            &ctx.storage,
            &task.id,
            retries,
            &format!("Failed to update instance after post provision: {e}"),
        )
        .await;
        return;
    }
    finish_task(&ctx.storage, &task.id, task.retries, "", "finished").await;
}

async fn handle_notify_create(ctx: &WorkerContext, task: &Task) {
    if task.retries >= DEFAULT_RETRY_CAP {
        finish_task(
            &ctx.storage,
            &task.id,
            task.retries,
            &format!("Unable to deliver webhook: {}", task.result),
            "failed",
        )
        .await;
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    if !instance.is_available() {
        requeue_task(&ctx.storage, &task.id, retries, "No change in status since last check").await;
        return;
    }

    let metadata: WebhookMetadata = match serde_json::from_str(&task.metadata) {
        Ok(metadata) => metadata,
        Err(e) => {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Cannot unmarshal task metadata to callback on create service: {e}"),
            )
            .await;
            return;
        }
    };

    let status = match webhook::deliver_created(&ctx.http, &metadata.url, &metadata.secret).await {
        Ok(status) => status,
        Err(e) => {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Failed to send http post operation: {e}"),
            )
            .await;
            return;
        }
    };

    if webhook::is_delivered(status) {
        finish_task(&ctx.storage, &task.id, task.retries, status.as_str(), "finished").await;
    } else if ctx.retry_webhooks {
        requeue_task(
            &ctx.storage,
            &task.id,
            retries,
            &format!("Got invalid http status code from hook: {status}"),
        )
        .await;
    } else {
        finish_task(
            &ctx.storage,
            &task.id,
            task.retries,
            &format!("Got invalid http status code from hook: {status}"),
            "failed",
        )
        .await;
    }
}

async fn handle_change_plans(ctx: &WorkerContext, task: &Task) {
    if exhausted(&ctx.storage, task, DEFAULT_RETRY_CAP, "change plans for database").await {
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    let metadata: ChangePlansMetadata = match serde_json::from_str(&task.metadata) {
        Ok(metadata) => metadata,
        Err(e) => {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Cannot unmarshal task metadata to change plans: {e}"),
            )
            .await;
            return;
        }
    };
    match upgrade_within_providers(ctx, &instance, &metadata.plan).await {
        Ok(output) => finish_task(&ctx.storage, &task.id, task.retries, &output, "finished").await,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot change plans: {e}")).await
        }
    }
}

async fn handle_change_providers(ctx: &WorkerContext, task: &Task) {
    if exhausted(&ctx.storage, task, DEFAULT_RETRY_CAP, "change providers for database").await {
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    let metadata: ChangeProvidersMetadata = match serde_json::from_str(&task.metadata) {
        Ok(metadata) => metadata,
        Err(e) => {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Cannot unmarshal task metadata to change providers: {e}"),
            )
            .await;
            return;
        }
    };
    match upgrade_across_providers(ctx, &instance, &metadata.plan).await {
        Ok(output) => finish_task(&ctx.storage, &task.id, task.retries, &output, "finished").await,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot switch providers: {e}"))
                .await
        }
    }
}

async fn handle_restore(ctx: &WorkerContext, task: &Task) {
    if exhausted(&ctx.storage, task, DEFAULT_RETRY_CAP, "restore database").await {
        return;
    }
    let retries = task.retries + 1;

    let instance = match resolve_instance(&ctx.storage, &ctx.registry, &task.database_id).await {
        Ok(instance) => instance,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get instance: {e}")).await;
            return;
        }
    };
    let metadata: RestoreMetadata = match serde_json::from_str(&task.metadata) {
        Ok(metadata) => metadata,
        Err(e) => {
            requeue_task(
                &ctx.storage,
                &task.id,
                retries,
                &format!("Cannot unmarshal task metadata to restore database: {e}"),
            )
            .await;
            return;
        }
    };
    let provider = match ctx.registry.provider_for_plan(&instance.plan).await {
        Ok(provider) => provider,
        Err(e) => {
            requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot get provider: {e}")).await;
            return;
        }
    };
    if let Err(e) = provider.restore_backup(&instance, &metadata.backup).await {
        requeue_task(&ctx.storage, &task.id, retries, &format!("Cannot restore backup: {e}")).await;
        return;
    }
    finish_task(&ctx.storage, &task.id, task.retries, "", "finished").await;
}

/// Same-backend plan change. Falls through to the cross-provider migration
/// when the backend cannot modify in place.
pub async fn upgrade_within_providers(
    ctx: &WorkerContext,
    from: &Instance,
    to_plan_id: &str,
) -> Result<String, String> {
    let to_plan = ctx
        .storage
        .get_plan_by_id(to_plan_id)
        .await
        .map_err(|e| e.to_string())?;
    let provider = ctx
        .registry
        .provider_for_plan(&from.plan)
        .await
        .map_err(|e| e.to_string())?;
    if to_plan_id.eq_ignore_ascii_case(&from.plan.id) {
        return Err("Cannot upgrade to the same plan".to_string());
    }
    if to_plan.provider != from.plan.provider {
        return Err("Unable to upgrade, different providers were passed in on both plans".to_string());
    }

    // This could take a very long time.
    let upgraded = match provider.modify(from, &to_plan).await {
        Ok(upgraded) => upgraded,
        Err(ProviderError::Unsupported) => {
            return upgrade_across_providers(ctx, from, to_plan_id).await
        }
        Err(e) => return Err(e.to_string()),
    };

    let plan_id = upgraded.plan.id.clone();
    ctx.storage
        .update_instance(&upgraded, &plan_id)
        .await
        .map_err(|e| format!("Cannot update instance in database after upgrade: {e}"))?;

    if !upgraded.is_available() {
        if let Err(e) = ctx
            .storage
            .add_task(&upgraded.id, TaskAction::ResyncFromProvider, "")
            .await
        {
            error!(instance = %upgraded.name, error = %e, "unable to schedule resync from provider");
        }
    }
    Ok(String::new())
}

/// Cross-provider logical migration: provision a twin on the target backend
/// under the same instance id, dump-and-load, re-point the registry row,
/// deprovision the source. Only defined for postgres.
pub async fn upgrade_across_providers(
    ctx: &WorkerContext,
    from: &Instance,
    to_plan_id: &str,
) -> Result<String, String> {
    let to_plan = ctx
        .storage
        .get_plan_by_id(to_plan_id)
        .await
        .map_err(|e| e.to_string())?;
    let to_provider = ctx
        .registry
        .provider_for_plan(&to_plan)
        .await
        .map_err(|e| e.to_string())?;
    let from_provider = ctx
        .registry
        .provider_for_plan(&from.plan)
        .await
        .map_err(|e| e.to_string())?;
    if to_plan_id.eq_ignore_ascii_case(&from.plan.id) {
        return Err("Cannot upgrade to the same plan".to_string());
    }
    if from.engine != "postgres" {
        return Err("Can only upgrade across providers on postgres".to_string());
    }

    let created = to_provider
        .provision(&from.id, &to_plan, "")
        .await
        .map_err(|e| e.to_string())?;

    // Poll the target until it is available, cleaning up the orphan on any
    // failure or timeout.
    let mut target: Option<Instance> = None;
    for poll in 0..MIGRATION_POLLS {
        match to_provider.get_instance(&created.name, &to_plan).await {
            Ok(candidate) => {
                if candidate.is_available() {
                    target = Some(candidate);
                    break;
                }
            }
            Err(e) => {
                error!(instance = %created.name, error = %e, "unable to get instance during migration");
                abandon_migration_target(ctx, &to_provider, &created).await;
                return Err("The database instance could not be obtained.".to_string());
            }
        }
        if poll == MIGRATION_POLLS - 1 {
            abandon_migration_target(ctx, &to_provider, &created).await;
            return Err("The database provisioning never finished.".to_string());
        }
        tokio::time::sleep(MIGRATION_POLL_PAUSE).await;
    }
    let Some(mut target) = target else {
        return Err("The database provisioning never finished.".to_string());
    };

    target.id = from.id.clone();
    target.username = created.username.clone();
    target.password = created.password.clone();

    let output = run_logical_copy(from, &target).await?;

    let to_plan_id = target.plan.id.clone();
    if let Err(e) = ctx.storage.update_instance(&target, &to_plan_id).await {
        error!(
            instance = %target.name,
            plan = %to_plan_id,
            error = %e,
            "cannot update instance in database after provider change"
        );
        abandon_migration_target(ctx, &to_provider, &target).await;
        return Err(e.to_string());
    }

    if let Err(e) = from_provider.deprovision(from, true).await {
        // The instance id now points at the new backend, so a delete task
        // would tear down the wrong database. Log loudly instead.
        error!(
            instance = %from.name,
            plan = %from.plan.id,
            error = %e,
            "ORPHAN: cannot deprovision source database after provider change"
        );
    }

    Ok(output)
}

/// Deprovision a half-migrated target, falling back to a delete task.
async fn abandon_migration_target(
    ctx: &WorkerContext,
    provider: &Arc<dyn crate::providers::Provider>,
    target: &Instance,
) {
    if let Err(e) = provider.deprovision(target, false).await {
        error!(instance = %target.name, error = %e, "unable to clean up migration target");
        if let Err(task_err) = ctx
            .storage
            .add_task(&target.id, TaskAction::Delete, &target.name)
            .await
        {
            error!(
                instance = %target.name,
                error = %task_err,
                "ORPHAN: unable to add task to delete migration target"
            );
        }
    }
}

/// `pg_dump | psql` from the source endpoint into the target.
async fn run_logical_copy(from: &Instance, to: &Instance) -> Result<String, String> {
    let (host, port, _db) = split_endpoint(&from.endpoint);
    let port_flag = port.map(|p| format!(" -p {p}")).unwrap_or_default();
    let target_url = compose_url(&to.scheme, &to.username, &to.password, &to.endpoint);
    let command = format!(
        "set -o pipefail ; PGPASSWORD=\"{}\" pg_dump -xOc -d {} -h {}{} -U {} | psql {}",
        from.password, from.name, host, port_flag, from.username, target_url
    );

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .output()
        .await
        .map_err(|e| format!("unable to spawn logical copy: {e}"))?;
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        warn!(status = %output.status, "logical copy failed");
        return Err(format!("logical copy failed: {stderr}"));
    }
    Ok(stderr)
}

/// Split "host:port/db" into its parts; port and database are optional.
fn split_endpoint(endpoint: &str) -> (String, Option<String>, Option<String>) {
    match endpoint.split_once(':') {
        Some((host, rest)) => match rest.split_once('/') {
            Some((port, db)) => (host.to_string(), Some(port.to_string()), Some(db.to_string())),
            None => (host.to_string(), Some(rest.to_string()), None),
        },
        None => match endpoint.split_once('/') {
            Some((host, db)) => (host.to_string(), None, Some(db.to_string())),
            None => (endpoint.to_string(), None, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_endpoints() {
        assert_eq!(
            split_endpoint("db.example.com:5432/mydb"),
            (
                "db.example.com".to_string(),
                Some("5432".to_string()),
                Some("mydb".to_string())
            )
        );
        assert_eq!(
            split_endpoint("db.example.com/mydb"),
            ("db.example.com".to_string(), None, Some("mydb".to_string()))
        );
        assert_eq!(
            split_endpoint("db.example.com"),
            ("db.example.com".to_string(), None, None)
        );
    }

    #[test]
    fn task_metadata_wire_shapes() {
        let webhook: WebhookMetadata =
            serde_json::from_str(r#"{"url":"https://cb.example.com","secret":"s"}"#).unwrap();
        assert_eq!(webhook.url, "https://cb.example.com");
        let change: ChangeProvidersMetadata = serde_json::from_str(r#"{"plan":"p-1"}"#).unwrap();
        assert_eq!(change.plan, "p-1");
        let restore: RestoreMetadata = serde_json::from_str(r#"{"backup":"b-1"}"#).unwrap();
        assert_eq!(restore.backup, "b-1");
        assert_eq!(
            serde_json::to_string(&ChangePlansMetadata { plan: "p-2".into() }).unwrap(),
            r#"{"plan":"p-2"}"#
        );
    }
}
