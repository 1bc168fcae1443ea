// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the store and the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status;

/// Backend provider selector carried on each plan row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Managed single-node RDS instance.
    #[serde(rename = "aws-instance")]
    AwsInstance,
    /// Managed clustered RDS (Aurora).
    #[serde(rename = "aws-cluster")]
    AwsCluster,
    /// Managed Cloud SQL instance.
    #[serde(rename = "gcloud-instance")]
    GcloudInstance,
    /// Logical database on a shared postgres master.
    #[serde(rename = "postgres-shared")]
    PostgresShared,
    /// Logical database on a shared mysql master.
    #[serde(rename = "mysql-shared")]
    MysqlShared,
    /// Unrecognized provider tag; rejected at backend selection time.
    #[serde(rename = "unknown", other)]
    Unknown,
}

impl ProviderKind {
    /// Parse a plan row's provider tag. Unrecognized tags map to `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "aws-instance" => Self::AwsInstance,
            "aws-cluster" => Self::AwsCluster,
            "gcloud-instance" => Self::GcloudInstance,
            "postgres-shared" => Self::PostgresShared,
            "mysql-shared" => Self::MysqlShared,
            _ => Self::Unknown,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::AwsInstance => "aws-instance",
            Self::AwsCluster => "aws-cluster",
            Self::GcloudInstance => "gcloud-instance",
            Self::PostgresShared => "postgres-shared",
            Self::MysqlShared => "mysql-shared",
            Self::Unknown => "unknown",
        }
    }
}

/// A plan: sizing/engine/backend bundle under a service.
///
/// `provider_private_details` is the backend-specific creation template. It is
/// deliberately private and excluded from serialization so it can never leak
/// into a client-facing or webhook payload.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub name: String,
    pub human_name: String,
    pub description: String,
    pub engine: String,
    pub engine_version: String,
    pub scheme: String,
    pub categories: String,
    pub cost_cents: i32,
    pub cost_unit: String,
    #[serde(skip)]
    pub attributes: serde_json::Value,
    pub installable_inside_private_network: bool,
    pub installable_outside_private_network: bool,
    pub supports_multiple_installations: bool,
    pub supports_sharing: bool,
    pub preprovision: i32,
    pub beta: bool,
    pub deprecated: bool,
    pub provider: ProviderKind,
    #[serde(skip)]
    pub(crate) provider_private_details: String,
    #[serde(skip)]
    pub created: DateTime<Utc>,
    #[serde(skip)]
    pub updated: DateTime<Utc>,
}

impl Plan {
    /// Backend-specific creation template, already `${VAR}`-interpolated.
    pub fn provider_private_details(&self) -> &str {
        &self.provider_private_details
    }

    /// Lifecycle state string used in catalog metadata.
    pub fn state(&self) -> &'static str {
        if self.deprecated {
            "deprecated"
        } else if self.beta {
            "beta"
        } else {
            "ga"
        }
    }

}

/// Durable instance registry row, keyed by the externally supplied id.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DbEntry {
    /// Externally supplied instance id. Unique forever, tombstones included.
    pub id: String,
    /// Provider-generated resource name.
    pub name: String,
    /// Owning plan id.
    pub plan_id: String,
    /// Whether a client owns this row (false for warm-pool rows).
    pub claimed: bool,
    /// Last observed provider status.
    pub status: String,
    pub username: String,
    pub password: String,
    /// host:port/dbname
    pub endpoint: String,
    /// Count of currently started tasks for this instance.
    pub tasks: i64,
}

/// Runtime view of an instance: registry row + plan + live provider state.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    /// Provider-side identifier (ARN or resource name).
    pub provider_id: String,
    pub plan: Plan,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub endpoint: String,
    pub status: String,
    pub ready: bool,
    pub engine: String,
    pub engine_version: String,
    pub scheme: String,
}

impl Instance {
    /// Derived availability per the shared status vocabulary.
    pub fn is_available(&self) -> bool {
        status::is_available(&self.status)
    }
}

/// Credential projection for roles and replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseUrl {
    pub username: String,
    pub password: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan: String,
}

/// A backup (snapshot) descriptor returned by provider backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSpec {
    pub database: DatabaseSpec,
    pub id: Option<String>,
    pub progress: Option<i64>,
    pub status: Option<String>,
    #[serde(rename = "created_at")]
    pub created: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub name: String,
}

/// A provider-side log file descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileSpec {
    pub name: Option<String>,
    pub size: Option<i64>,
    #[serde(rename = "updated_at")]
    pub updated: String,
}

/// Deferred work kinds processed by the task engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Delete,
    ResyncFromProvider,
    ResyncUntilAvailable,
    ResyncReplicasFromProvider,
    NotifyCreateServiceWebhook,
    /// Named but never scheduled; kept for wire compatibility.
    NotifyCreateBindingWebhook,
    ChangeProviders,
    ChangePlans,
    RestoreDatabase,
    PerformPostProvision,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::ResyncFromProvider => "resync-from-provider",
            Self::ResyncUntilAvailable => "resync-until-available",
            Self::ResyncReplicasFromProvider => "resync-replicas-from-provider",
            Self::NotifyCreateServiceWebhook => "notify-create-service-webhook",
            Self::NotifyCreateBindingWebhook => "notify-create-binding-webhook",
            Self::ChangeProviders => "change-providers",
            Self::ChangePlans => "change-plans",
            Self::RestoreDatabase => "restore-database",
            Self::PerformPostProvision => "perform-post-provision",
        }
    }

    pub fn from_str(action: &str) -> Option<Self> {
        Some(match action {
            "delete" => Self::Delete,
            "resync-from-provider" => Self::ResyncFromProvider,
            "resync-until-available" => Self::ResyncUntilAvailable,
            "resync-replicas-from-provider" => Self::ResyncReplicasFromProvider,
            "notify-create-service-webhook" => Self::NotifyCreateServiceWebhook,
            "notify-create-binding-webhook" => Self::NotifyCreateBindingWebhook,
            "change-providers" => Self::ChangeProviders,
            "change-plans" => Self::ChangePlans,
            "restore-database" => Self::RestoreDatabase,
            "perform-post-provision" => Self::PerformPostProvision,
            _ => return None,
        })
    }
}

/// A unit of deferred work popped from the queue.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub action: TaskAction,
    pub database_id: String,
    pub status: String,
    pub retries: i64,
    /// Action-specific JSON blob.
    pub metadata: String,
    pub result: String,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

/// Catalog entry: a service with its plans, shaped for the OSB catalog verb.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub bindings_retrievable: bool,
    pub plan_updateable: bool,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub plans: Vec<CatalogPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub metadata: serde_json::Value,
}

impl CatalogPlan {
    /// Build the catalog projection of a plan. The provider-private details
    /// and backend tag are intentionally absent.
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            id: plan.id.clone(),
            name: plan.name.clone(),
            description: plan.description.clone(),
            free: plan.cost_cents == 0,
            metadata: serde_json::json!({
                "addon_service": {
                    "id": plan.service_id,
                    "name": plan.service_name,
                },
                "created_at": plan.created,
                "updated_at": plan.updated,
                "description": plan.description,
                "human_name": plan.human_name,
                "id": plan.id,
                "name": plan.name,
                "key": format!("{}:{}", plan.service_name, plan.name),
                "price": {
                    "cents": plan.cost_cents,
                    "unit": plan.cost_unit,
                },
                "installable_inside_private_network": plan.installable_inside_private_network,
                "installable_outside_private_network": plan.installable_outside_private_network,
                "space_default": false,
                "state": plan.state(),
                "attributes": plan.attributes,
                "engine": {
                    "type": plan.engine,
                    "version": plan.engine_version,
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips_known_tags() {
        for tag in [
            "aws-instance",
            "aws-cluster",
            "gcloud-instance",
            "postgres-shared",
            "mysql-shared",
        ] {
            assert_eq!(ProviderKind::from_tag(tag).as_tag(), tag);
        }
        assert_eq!(ProviderKind::from_tag("vax-cluster"), ProviderKind::Unknown);
    }

    #[test]
    fn task_action_round_trips() {
        let actions = [
            TaskAction::Delete,
            TaskAction::ResyncFromProvider,
            TaskAction::ResyncUntilAvailable,
            TaskAction::ResyncReplicasFromProvider,
            TaskAction::NotifyCreateServiceWebhook,
            TaskAction::NotifyCreateBindingWebhook,
            TaskAction::ChangeProviders,
            TaskAction::ChangePlans,
            TaskAction::RestoreDatabase,
            TaskAction::PerformPostProvision,
        ];
        for action in actions {
            assert_eq!(TaskAction::from_str(action.as_str()), Some(action));
        }
        assert_eq!(TaskAction::from_str("defrag"), None);
    }

    #[test]
    fn instance_serialization_hides_secrets() {
        let plan = Plan {
            id: "p1".into(),
            service_id: "s1".into(),
            service_name: "svc".into(),
            name: "hobby".into(),
            human_name: "Hobby".into(),
            description: "d".into(),
            engine: "postgres".into(),
            engine_version: "10.4".into(),
            scheme: "postgres".into(),
            categories: "Data Stores".into(),
            cost_cents: 0,
            cost_unit: "month".into(),
            attributes: serde_json::json!({}),
            installable_inside_private_network: true,
            installable_outside_private_network: true,
            supports_multiple_installations: true,
            supports_sharing: true,
            preprovision: 0,
            beta: false,
            deprecated: false,
            provider: ProviderKind::PostgresShared,
            provider_private_details: "{\"master_uri\":\"postgres://top:secret@h/x\"}".into(),
            created: Utc::now(),
            updated: Utc::now(),
        };
        let instance = Instance {
            id: "i1".into(),
            name: "corraldb1".into(),
            provider_id: "corraldb1".into(),
            plan,
            username: "u1".into(),
            password: "hunter2".into(),
            endpoint: "h:5432/corraldb1".into(),
            status: "available".into(),
            ready: true,
            engine: "postgres".into(),
            engine_version: "10.4".into(),
            scheme: "postgres".into(),
        };
        let json = serde_json::to_string(&instance).unwrap();
        assert!(!json.contains("hunter2"), "password leaked: {json}");
        assert!(!json.contains("master_uri"), "private details leaked: {json}");
        assert!(!json.contains("secret"), "private details leaked: {json}");
    }

    #[test]
    fn catalog_plan_omits_backend_internals() {
        let plan = Plan {
            id: "p1".into(),
            service_id: "s1".into(),
            service_name: "svc".into(),
            name: "hobby".into(),
            human_name: "Hobby".into(),
            description: "d".into(),
            engine: "postgres".into(),
            engine_version: "10.4".into(),
            scheme: "postgres".into(),
            categories: "Data Stores".into(),
            cost_cents: 500,
            cost_unit: "month".into(),
            attributes: serde_json::json!({"ram": "1GB"}),
            installable_inside_private_network: true,
            installable_outside_private_network: true,
            supports_multiple_installations: true,
            supports_sharing: true,
            preprovision: 0,
            beta: true,
            deprecated: false,
            provider: ProviderKind::PostgresShared,
            provider_private_details: "{\"master_uri\":\"postgres://x\"}".into(),
            created: Utc::now(),
            updated: Utc::now(),
        };
        let catalog = CatalogPlan::from_plan(&plan);
        assert!(!catalog.free);
        assert_eq!(catalog.metadata["state"], "beta");
        assert_eq!(catalog.metadata["engine"]["version"], "10.4");
        let json = serde_json::to_string(&catalog).unwrap();
        assert!(!json.contains("master_uri"));
    }
}
