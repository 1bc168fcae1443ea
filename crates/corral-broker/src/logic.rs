// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle controller.
//!
//! [`BusinessLogic`] implements the OSB verbs and the per-instance action
//! handlers. Mutating verbs serialize on a process-wide mutex for their whole
//! duration; read verbs do not take it, and neither do the background loops,
//! which rely on the store's transactional primitives instead. Anything that
//! could hold the mutex across a multi-minute backend call is handed to the
//! task engine instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};

use corral_store::models::{Instance, ProviderKind, TaskAction};
use corral_store::{status, Storage, StoreError};

use crate::actions::{self, Action};
use crate::error::{BrokerError, Result};
use crate::osb::{
    BindRequest, BindResponse, CatalogResponse, DeprovisionRequest, DeprovisionResponse,
    GetBindingRequest, GetBindingResponse, LastOperationRequest, LastOperationResponse,
    OperationState, ProvisionRequest, ProvisionResponse, UnbindRequest, UnbindResponse,
    UpdateRequest, UpdateResponse,
};
use crate::providers::{compose_url, Provider, ProviderError, ProviderRegistry};
use crate::tasks::{ChangePlansMetadata, ChangeProvidersMetadata, RestoreMetadata, WebhookMetadata};

/// Failure to materialize the full runtime view of an instance.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No live registry row for this id.
    #[error("Cannot find database instance")]
    NotFound,

    #[error("{0}")]
    Store(StoreError),

    #[error("{0}")]
    Provider(#[from] ProviderError),
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InstanceNotFound => ResolveError::NotFound,
            other => ResolveError::Store(other),
        }
    }
}

/// Materialize the full `Instance` view: registry row + plan + live provider
/// state, with the broker-owned fields grafted on. Pure composition, no
/// mutation.
pub async fn resolve_instance(
    storage: &Storage,
    registry: &ProviderRegistry,
    id: &str,
) -> std::result::Result<Instance, ResolveError> {
    let entry = storage.get_instance(id).await?;
    let plan = storage.get_plan_by_id(&entry.plan_id).await?;
    let provider = registry.provider_for_plan(&plan).await?;
    let mut instance = provider.get_instance(&entry.name, &plan).await?;
    instance.id = entry.id;
    instance.username = entry.username;
    instance.password = entry.password;
    instance.plan = plan;
    Ok(instance)
}

/// Same composition for an instance's read replica.
pub async fn resolve_replica(
    storage: &Storage,
    registry: &ProviderRegistry,
    id: &str,
) -> std::result::Result<Instance, ResolveError> {
    let entry = storage.get_instance(id).await?;
    let plan = storage.get_plan_by_id(&entry.plan_id).await?;
    let provider = registry.provider_for_plan(&plan).await?;
    let instance = provider.get_instance(&entry.name, &plan).await?;
    let mut replica = provider.get_read_replica(&instance).await?;
    // Replica credentials mirror the primary's.
    replica.id = entry.id;
    replica.username = entry.username;
    replica.password = entry.password;
    replica.plan = plan;
    // Some backends report the replica endpoint under its own -ro resource
    // name; clients connect to the database name.
    if let Some(stripped) = replica.endpoint.strip_suffix("-ro") {
        replica.endpoint = stripped.to_string();
    }
    Ok(replica)
}

fn internal(context: &str, err: impl std::fmt::Display) -> BrokerError {
    error!("{context}: {err}");
    BrokerError::Internal
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| internal("unable to serialize action response", e))
}

/// The OSB lifecycle controller.
pub struct BusinessLogic {
    storage: Arc<Storage>,
    registry: Arc<ProviderRegistry>,
    actions: Vec<Action>,
    /// Serializes mutating verbs across concurrent requests.
    lock: Mutex<()>,
}

impl BusinessLogic {
    pub fn new(storage: Arc<Storage>, name_prefix: &str) -> Self {
        Self {
            storage,
            registry: Arc::new(ProviderRegistry::new(name_prefix)),
            actions: actions::action_table(),
            lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    pub fn registry(&self) -> Arc<ProviderRegistry> {
        self.registry.clone()
    }

    /// The action registration table, for the transport to convert to routes.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// OpenAPI document for one registered action.
    pub fn action_schema(&self, action_name: &str, instance_id: &str) -> Option<serde_json::Value> {
        actions::action_schema(&self.actions, action_name, instance_id)
    }

    async fn resolve(&self, id: &str) -> std::result::Result<Instance, ResolveError> {
        resolve_instance(&self.storage, &self.registry, id).await
    }

    async fn provider_for(&self, instance: &Instance) -> Result<Arc<dyn Provider>> {
        self.registry
            .provider_for_plan(&instance.plan)
            .await
            .map_err(|e| internal("cannot find provider for plan", e))
    }

    // ------------------------------------------------------------------
    // OSB verbs
    // ------------------------------------------------------------------

    pub async fn get_catalog(&self) -> Result<CatalogResponse> {
        let services = self
            .storage
            .get_services()
            .await
            .map_err(|e| internal("unable to load catalog", e))?;
        Ok(CatalogResponse { services })
    }

    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse> {
        let _guard = self.lock.lock().await;

        if !request.accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }
        if request.instance_id.is_empty() {
            return Err(BrokerError::InstanceRequired);
        }

        let plan = match self.storage.get_plan_by_id(&request.plan_id).await {
            Ok(plan) => plan,
            Err(StoreError::PlanNotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("unable to provision (get plan failed)", e)),
        };

        // An id that has ever existed may never be provisioned again.
        match self.storage.validate_instance_id(&request.instance_id).await {
            Ok(()) => {}
            Err(e @ StoreError::InstanceIdTaken) => {
                return Err(BrokerError::InstanceInvalid(e.to_string()))
            }
            Err(e) => return Err(internal("unable to validate instance id", e)),
        }

        let mut response = ProvisionResponse::default();
        let instance = match self.resolve(&request.instance_id).await {
            Ok(instance) => {
                if !instance.plan.id.eq_ignore_ascii_case(&request.plan_id) {
                    return Err(BrokerError::Conflict("InstanceID in use".to_string()));
                }
                response.exists = true;
                instance
            }
            Err(ResolveError::NotFound) => {
                match self.claim_unclaimed(&request.plan_id, &request.instance_id).await {
                    Ok(instance) => instance,
                    Err(ResolveError::NotFound) => self.cold_create(request, &plan).await?,
                    Err(e) => {
                        return Err(internal("fatal error from unclaimed instance claim", e))
                    }
                }
            }
            Err(e) => return Err(internal("unable to resolve instance", e)),
        };

        // This is a hack to support callbacks, hopefully this will become an
        // OSB standard.
        if let (Some(url), Some(secret)) = (&request.webhook, &request.secret) {
            let metadata = serde_json::to_string(&WebhookMetadata {
                url: url.clone(),
                secret: secret.clone(),
            })
            .map_err(|e| internal("failed to marshal webhook task metadata", e))?;
            if let Err(e) = self
                .storage
                .add_task(&instance.id, TaskAction::NotifyCreateServiceWebhook, &metadata)
                .await
            {
                error!(instance = %instance.name, error = %e, "unable to schedule webhook notification");
            }
        }

        if !instance.ready {
            response.is_async = true;
            response.operation = Some(request.instance_id.clone());
        }
        response.extension_apis = actions::extension_apis(&self.actions, &instance.id);
        Ok(response)
    }

    /// Claim a warm-pool row and materialize it; on a failed materialization
    /// the row goes back into the pool.
    async fn claim_unclaimed(
        &self,
        plan_id: &str,
        instance_id: &str,
    ) -> std::result::Result<Instance, ResolveError> {
        let entry = self
            .storage
            .get_unclaimed_instance(plan_id, instance_id)
            .await?;
        match self.resolve(&entry.id).await {
            Ok(instance) => {
                info!(instance = %instance.name, id = %instance_id, "served provision from warm pool");
                Ok(instance)
            }
            Err(e) => {
                self.storage.return_claimed_instance(&entry.id).await?;
                Err(e)
            }
        }
    }

    /// Create a brand new instance at the backend and record it, with the
    /// orphan safety net on bookkeeping failure.
    async fn cold_create(
        &self,
        request: &ProvisionRequest,
        plan: &corral_store::Plan,
    ) -> Result<Instance> {
        let provider = self
            .registry
            .provider_for_plan(plan)
            .await
            .map_err(|e| internal("unable to provision, cannot find provider", e))?;
        let instance = provider
            .provision(&request.instance_id, plan, &request.organization_guid)
            .await
            .map_err(|e| internal("error provisioning database", e))?;

        if let Err(e) = self.storage.add_instance(&instance).await {
            error!(instance = %instance.name, error = %e, "error inserting record into provisioned table");
            if let Err(deprovision_err) = provider.deprovision(&instance, false).await {
                error!(
                    id = %instance.id,
                    instance = %instance.name,
                    error = %deprovision_err,
                    "cleanup deprovision failed after bookkeeping failure"
                );
                if let Err(task_err) = self
                    .storage
                    .add_task(&instance.id, TaskAction::Delete, &instance.name)
                    .await
                {
                    error!(
                        instance = %instance.name,
                        error = %task_err,
                        "ORPHAN: unable to schedule deletion of unrecorded instance"
                    );
                }
            }
            return Err(BrokerError::Internal);
        }

        if !status::is_available(&instance.status) {
            // Cloud SQL instances still need their application user created;
            // everything else just needs to be watched until available.
            let followup = if plan.provider == ProviderKind::GcloudInstance {
                TaskAction::PerformPostProvision
            } else {
                TaskAction::ResyncUntilAvailable
            };
            if let Err(e) = self.storage.add_task(&instance.id, followup, "").await {
                error!(instance = %instance.name, error = %e, "unable to schedule post-provision followup");
            }
        }
        Ok(instance)
    }

    pub async fn deprovision(&self, request: &DeprovisionRequest) -> Result<DeprovisionResponse> {
        let _guard = self.lock.lock().await;

        let instance = match self.resolve(&request.instance_id).await {
            Ok(instance) => instance,
            Err(ResolveError::NotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("error finding instance during deprovision", e)),
        };
        let provider = self.provider_for(&instance).await?;

        let replicas = self
            .storage
            .has_replicas(&instance)
            .await
            .map_err(|e| internal("unable to get replica count", e))?;
        if replicas > 0 {
            if let Err(e) = provider.delete_read_replica(&instance).await {
                error!(id = %instance.id, instance = %instance.name, error = %e, "failed to remove replica");
                self.storage
                    .add_task(&instance.id, TaskAction::Delete, &instance.name)
                    .await
                    .map_err(|e| internal("unable to schedule delete from provider", e))?;
                return Ok(DeprovisionResponse { is_async: true });
            }
        }

        if let Err(e) = provider.deprovision(&instance, true).await {
            error!(id = %instance.id, instance = %instance.name, error = %e, "failed to deprovision");
            self.storage
                .add_task(&instance.id, TaskAction::Delete, &instance.name)
                .await
                .map_err(|e| internal("unable to schedule delete from provider", e))?;
            return Ok(DeprovisionResponse { is_async: true });
        }

        self.storage
            .delete_instance(&instance.id)
            .await
            .map_err(|e| internal("error removing record from provisioned table", e))?;
        Ok(DeprovisionResponse { is_async: false })
    }

    pub async fn update(&self, request: &UpdateRequest) -> Result<UpdateResponse> {
        if !request.accepts_incomplete {
            return Err(BrokerError::Unprocessable);
        }
        let instance = match self.resolve(&request.instance_id).await {
            Ok(instance) => instance,
            Err(ResolveError::NotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("error finding instance during update", e)),
        };
        let Some(plan_id) = &request.plan_id else {
            return Err(BrokerError::Unprocessable);
        };

        if !instance.is_available() {
            return Err(BrokerError::ConcurrencyError);
        }
        if plan_id.eq_ignore_ascii_case(&instance.plan.id) {
            return Err(BrokerError::UpgradeError(
                "Cannot upgrade to the same plan.".to_string(),
            ));
        }

        let target_plan = match self.storage.get_plan_by_id(plan_id).await {
            Ok(plan) => plan,
            Err(StoreError::PlanNotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("unable to update database (get plan failed)", e)),
        };

        if instance.plan.provider != target_plan.provider {
            if instance.engine != "postgres" {
                return Err(BrokerError::UpgradeError(
                    "Cannot upgrade across providers for non-postgres databases.".to_string(),
                ));
            }
            let metadata = serde_json::to_string(&ChangeProvidersMetadata {
                plan: plan_id.clone(),
            })
            .map_err(|e| internal("unable to marshal change provider task metadata", e))?;
            self.storage
                .add_task(&instance.id, TaskAction::ChangeProviders, &metadata)
                .await
                .map_err(|e| internal("unable to schedule upgrade across providers", e))?;
        } else {
            let metadata = serde_json::to_string(&ChangePlansMetadata {
                plan: plan_id.clone(),
            })
            .map_err(|e| internal("unable to marshal change plans task metadata", e))?;
            self.storage
                .add_task(&instance.id, TaskAction::ChangePlans, &metadata)
                .await
                .map_err(|e| internal("unable to schedule upgrade of a plan", e))?;
        }
        Ok(UpdateResponse { is_async: true })
    }

    pub async fn last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse> {
        let upgrading = self
            .storage
            .is_upgrading(&request.instance_id)
            .await
            .map_err(|e| internal("unable to get database status (is_upgrading failed)", e))?;
        let restoring = self
            .storage
            .is_restoring(&request.instance_id)
            .await
            .map_err(|e| internal("unable to get database status (is_restoring failed)", e))?;

        if upgrading || restoring {
            let mut description = if upgrading { "upgrading" } else { "restoring" }.to_string();
            if let Ok(instance) = self.resolve(&request.instance_id).await {
                if !instance.is_available() {
                    description = instance.status;
                }
            }
            return Ok(LastOperationResponse {
                state: OperationState::InProgress,
                description: Some(description),
            });
        }

        let instance = match self.resolve(&request.instance_id).await {
            Ok(instance) => instance,
            Err(ResolveError::NotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("unable to get database status", e)),
        };

        // Opportunistically refresh the store's view while we have the live
        // one in hand.
        let plan_id = instance.plan.id.clone();
        if let Err(e) = self.storage.update_instance(&instance, &plan_id).await {
            error!(id = %instance.id, error = %e, "unable to refresh instance row during last_operation");
        }

        let state = if instance.ready {
            OperationState::Succeeded
        } else if status::in_progress(&instance.status) {
            OperationState::InProgress
        } else {
            OperationState::Failed
        };
        Ok(LastOperationResponse {
            state,
            description: Some(instance.status),
        })
    }

    pub async fn bind(&self, request: &BindRequest) -> Result<BindResponse> {
        let _guard = self.lock.lock().await;

        let instance = match self.resolve(&request.instance_id).await {
            Ok(instance) => instance,
            Err(ResolveError::NotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("error finding instance during bind", e)),
        };
        if !instance.ready {
            return Err(BrokerError::Unprocessable);
        }
        let provider = self.provider_for(&instance).await?;

        if let Some(app_guid) = &request.app_guid {
            provider
                .tag(&instance, "Binding", &request.binding_id)
                .await
                .map_err(|e| internal("error tagging instance with binding", e))?;
            provider
                .tag(&instance, "App", app_guid)
                .await
                .map_err(|e| internal("error tagging instance with app", e))?;
        }

        Ok(BindResponse {
            is_async: false,
            credentials: self.credentials_for(&instance).await?,
        })
    }

    pub async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse> {
        let _guard = self.lock.lock().await;

        let instance = match self.resolve(&request.instance_id).await {
            Ok(instance) => instance,
            Err(ResolveError::NotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("error finding instance during unbind", e)),
        };
        if !instance.ready {
            return Err(BrokerError::Unprocessable);
        }
        let provider = self.provider_for(&instance).await?;
        provider
            .untag(&instance, "Binding")
            .await
            .map_err(|e| internal("error untagging binding", e))?;
        provider
            .untag(&instance, "App")
            .await
            .map_err(|e| internal("error untagging app", e))?;
        Ok(UnbindResponse { is_async: false })
    }

    pub async fn get_binding(&self, request: &GetBindingRequest) -> Result<GetBindingResponse> {
        let instance = match self.resolve(&request.instance_id).await {
            Ok(instance) => instance,
            Err(ResolveError::NotFound) => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("error finding instance during get binding", e)),
        };
        if !status::can_get_bindings(&instance.status) {
            return Err(BrokerError::ServiceNotYetAvailable);
        }
        Ok(GetBindingResponse {
            credentials: self.credentials_for(&instance).await?,
        })
    }

    /// The credential map for a binding: the primary URL, plus the read-only
    /// URL when a replica exists.
    async fn credentials_for(
        &self,
        instance: &Instance,
    ) -> Result<std::collections::BTreeMap<String, String>> {
        let mut credentials = std::collections::BTreeMap::new();
        credentials.insert(
            "DATABASE_URL".to_string(),
            compose_url(
                &instance.scheme,
                &instance.username,
                &instance.password,
                &instance.endpoint,
            ),
        );
        match self.storage.get_replica(instance).await {
            Ok(Some(replica)) if !replica.endpoint.is_empty() => {
                credentials.insert(
                    "DATABASE_READONLY_URL".to_string(),
                    compose_url(
                        &instance.scheme,
                        &replica.username,
                        &replica.password,
                        &replica.endpoint,
                    ),
                );
            }
            Ok(_) => {}
            Err(e) => return Err(internal("replica lookup failed composing credentials", e)),
        }
        Ok(credentials)
    }

    // ------------------------------------------------------------------
    // Action handlers
    // ------------------------------------------------------------------

    /// Route a registered action by name. `params` carries the path
    /// parameters ("role", "backup").
    pub async fn dispatch_action(
        &self,
        action_name: &str,
        instance_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<serde_json::Value> {
        let param = |key: &str| params.get(key).cloned().unwrap_or_default();
        match action_name {
            "list_backups" => to_value(&self.action_list_backups(instance_id).await?),
            "get_backup" => to_value(&self.action_get_backup(instance_id, &param("backup")).await?),
            "create_backup" => to_value(&self.action_create_backup(instance_id).await?),
            "restore_backup" => {
                to_value(&self.action_restore_backup(instance_id, &param("backup")).await?)
            }
            "list_roles" => to_value(&self.action_list_roles(instance_id).await?),
            "get_role" => to_value(&self.action_get_role(instance_id, &param("role")).await?),
            "create_role" => to_value(&self.action_create_role(instance_id).await?),
            "rotate_role" => to_value(&self.action_rotate_role(instance_id, &param("role")).await?),
            "delete_role" => to_value(&self.action_delete_role(instance_id, &param("role")).await?),
            "view_logs" => to_value(&self.action_view_logs(instance_id).await?),
            "restart" => to_value(&self.action_restart(instance_id).await?),
            "get_replica" => to_value(&self.action_get_replica(instance_id).await?),
            "create_replica" => to_value(&self.action_create_replica(instance_id).await?),
            "delete_replica" => to_value(&self.action_delete_replica(instance_id).await?),
            _ => Err(BrokerError::NotFound),
        }
    }

    async fn resolve_or_404(&self, instance_id: &str) -> Result<Instance> {
        self.resolve(instance_id)
            .await
            .map_err(|_| BrokerError::NotFound)
    }

    pub async fn action_list_backups(
        &self,
        instance_id: &str,
    ) -> Result<Vec<corral_store::BackupSpec>> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;
        provider
            .list_backups(&instance)
            .await
            .map_err(|e| internal("unable to list backups", e))
    }

    pub async fn action_get_backup(
        &self,
        instance_id: &str,
        backup: &str,
    ) -> Result<corral_store::BackupSpec> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;
        match provider.get_backup(&instance, backup).await {
            Ok(spec) => Ok(spec),
            Err(ProviderError::NotFound) => Err(BrokerError::NotFound),
            Err(e) => Err(internal("unable to get backup", e)),
        }
    }

    pub async fn action_create_backup(
        &self,
        instance_id: &str,
    ) -> Result<corral_store::BackupSpec> {
        let instance = self.resolve_or_404(instance_id).await?;
        if !status::can_be_modified(&instance.status) {
            return Err(BrokerError::ServiceNotYetAvailable);
        }
        let provider = self.provider_for(&instance).await?;
        provider
            .create_backup(&instance)
            .await
            .map_err(|e| internal("unable to create backup", e))
    }

    pub async fn action_restore_backup(
        &self,
        instance_id: &str,
        backup: &str,
    ) -> Result<serde_json::Value> {
        let instance = self.resolve_or_404(instance_id).await?;
        let metadata = serde_json::to_string(&RestoreMetadata {
            backup: backup.to_string(),
        })
        .map_err(|e| internal("failed to marshal restore task metadata", e))?;
        self.storage
            .add_task(&instance.id, TaskAction::RestoreDatabase, &metadata)
            .await
            .map_err(|e| internal("unable to schedule restore backup", e))?;
        Ok(serde_json::json!({"status": "OK"}))
    }

    pub async fn action_list_roles(
        &self,
        instance_id: &str,
    ) -> Result<Vec<corral_store::DatabaseUrl>> {
        let instance = self.resolve_or_404(instance_id).await?;
        self.storage
            .list_roles(&instance)
            .await
            .map_err(|e| internal("cannot list roles for instance", e))
    }

    pub async fn action_get_role(
        &self,
        instance_id: &str,
        role: &str,
    ) -> Result<corral_store::DatabaseUrl> {
        let instance = self.resolve_or_404(instance_id).await?;
        match self.storage.get_role(&instance, role).await {
            Ok(Some(role)) => Ok(role),
            Ok(None) => Err(BrokerError::NotFound),
            Err(e) => Err(internal("unable to get role", e)),
        }
    }

    pub async fn action_create_role(
        &self,
        instance_id: &str,
    ) -> Result<corral_store::DatabaseUrl> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;
        let role = provider
            .create_read_only_user(&instance)
            .await
            .map_err(|e| internal("unable to create read only role", e))?;
        if let Err(e) = self
            .storage
            .add_role(&instance, &role.username, &role.password)
            .await
        {
            if let Err(unwind_err) = provider.delete_read_only_user(&instance, &role.username).await
            {
                error!(
                    role = %role.username,
                    instance = %instance.name,
                    error = %unwind_err,
                    "orphaned read only user: unable to remove role while unwinding"
                );
            }
            return Err(internal("unable to insert the role", e));
        }
        Ok(role)
    }

    pub async fn action_rotate_role(
        &self,
        instance_id: &str,
        role: &str,
    ) -> Result<corral_store::DatabaseUrl> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;
        let rotated = provider
            .rotate_password_read_only_user(&instance, role)
            .await
            .map_err(|e| internal("unable to rotate password on read only role", e))?;
        self.storage
            .update_role(&instance, role, &rotated.password)
            .await
            .map_err(|e| internal("unable to record password change for read only role", e))?;
        Ok(rotated)
    }

    pub async fn action_delete_role(
        &self,
        instance_id: &str,
        role: &str,
    ) -> Result<serde_json::Value> {
        let instance = self.resolve_or_404(instance_id).await?;
        if instance.engine != "postgres" && instance.engine != "mysql" {
            return Err(BrokerError::Conflict(
                "I do not know how to do this on anything other than postgres or mysql.".to_string(),
            ));
        }
        let provider = self.provider_for(&instance).await?;

        let existing = self
            .storage
            .has_role(&instance, role)
            .await
            .map_err(|e| internal("unable to determine if database has role", e))?;
        if existing == 0 {
            return Err(BrokerError::NotFound);
        }

        provider
            .delete_read_only_user(&instance, role)
            .await
            .map_err(|e| internal("unable to delete read only user", e))?;
        self.storage
            .delete_role(&instance, role)
            .await
            .map_err(|e| internal("unable to delete database role", e))?;
        Ok(serde_json::json!({"status": "OK"}))
    }

    pub async fn action_list_logs(
        &self,
        instance_id: &str,
    ) -> Result<Vec<corral_store::LogFileSpec>> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;
        provider
            .list_logs(&instance)
            .await
            .map_err(|e| internal("unable to get a list of logs", e))
    }

    pub async fn action_get_logs(&self, instance_id: &str, path: &str) -> Result<String> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;
        provider
            .get_logs(&instance, path)
            .await
            .map_err(|e| internal("unable to get logs", e))
    }

    /// The most recently written log file's contents.
    pub async fn action_view_logs(&self, instance_id: &str) -> Result<serde_json::Value> {
        let mut logs = self.action_list_logs(instance_id).await?;
        logs.sort_by(|a, b| b.updated.cmp(&a.updated));
        let Some(newest) = logs.first().and_then(|log| log.name.clone()) else {
            return Ok(serde_json::json!({"logs": ""}));
        };
        let data = self.action_get_logs(instance_id, &newest).await?;
        Ok(serde_json::json!({"logs": data}))
    }

    pub async fn action_restart(&self, instance_id: &str) -> Result<serde_json::Value> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;
        provider
            .restart(&instance)
            .await
            .map_err(|e| internal("unable to restart database", e))?;
        Ok(serde_json::json!({"status": "OK"}))
    }

    pub async fn action_get_replica(
        &self,
        instance_id: &str,
    ) -> Result<corral_store::DatabaseUrl> {
        let instance = self.resolve_or_404(instance_id).await?;
        match self.storage.get_replica(&instance).await {
            Ok(Some(mut replica)) => {
                // Action endpoints never return secrets.
                replica.password = String::new();
                Ok(replica)
            }
            Ok(None) => Err(BrokerError::NotFound),
            Err(e) => Err(internal("unable to get replica", e)),
        }
    }

    pub async fn action_create_replica(&self, instance_id: &str) -> Result<Instance> {
        let instance = self.resolve_or_404(instance_id).await?;
        let _guard = self.lock.lock().await;

        let existing = self
            .storage
            .has_replicas(&instance)
            .await
            .map_err(|e| internal("error determining if database has replicas", e))?;
        if existing != 0 {
            return Err(BrokerError::Conflict(
                "Cannot create a replica, database already has one attached.".to_string(),
            ));
        }

        let provider = self.provider_for(&instance).await?;
        let replica = provider
            .create_read_replica(&instance)
            .await
            .map_err(|e| internal("unable to create read replica", e))?;

        if let Err(e) = self.storage.add_replica(&instance.id, &replica).await {
            error!(error = %e, "error inserting record into replicas table");
            if let Err(unwind_err) = provider.delete_read_replica(&instance).await {
                error!(
                    replica = %replica.name,
                    error = %unwind_err,
                    "error cleaning up unrecorded database replica"
                );
            }
            return Err(BrokerError::Internal);
        }

        if !status::is_available(&replica.status) {
            if let Err(e) = self
                .storage
                .add_task(&instance.id, TaskAction::ResyncReplicasFromProvider, "")
                .await
            {
                error!(instance = %instance.name, error = %e, "unable to schedule replica resync from provider");
            }
        }
        // Serialization drops the password field.
        Ok(replica)
    }

    pub async fn action_delete_replica(&self, instance_id: &str) -> Result<Instance> {
        let instance = self.resolve_or_404(instance_id).await?;
        let provider = self.provider_for(&instance).await?;

        let replica = provider
            .get_read_replica(&instance)
            .await
            .map_err(|e| internal("unable to find read replica to delete", e))?;
        provider
            .delete_read_replica(&instance)
            .await
            .map_err(|e| internal("unable to delete read replica", e))?;
        self.storage
            .delete_replica(&instance.id)
            .await
            .map_err(|e| internal("unable to delete replica record", e))?;
        Ok(replica)
    }
}
