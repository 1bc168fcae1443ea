// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed clustered RDS (Aurora) provider.
//!
//! A provisioned "instance" is a cluster plus one member; instance-level
//! operations are delegated to a composed [`AwsInstanceProvider`]. Teardown
//! deletes reader members first and writers last, so the cluster never
//! promotes a doomed reader mid-delete. Restore renames the whole cluster
//! aside, restores the snapshot under the original name, and recreates the
//! members.

use async_trait::async_trait;
use aws_sdk_rds::types::Tag;
use aws_sdk_rds::Client;
use serde::{Deserialize, Serialize};
use tracing::error;

use corral_store::models::{BackupSpec, DatabaseUrl, Instance, LogFileSpec, Plan};

use super::aws_instance::{AwsInstanceProvider, RdsCreateSpec, RdsInstanceSettings};
use super::{random_name, random_password, Provider, ProviderError};

const WAIT_POLL: std::time::Duration = std::time::Duration::from_secs(30);

/// Provider-private plan settings: one template for the cluster, one for its
/// members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RdsClusterSettings {
    pub instance: RdsInstanceSettings,
    pub cluster: RdsClusterTemplate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RdsClusterTemplate {
    pub backtrack_window: Option<i64>,
    pub backup_retention_period: Option<i32>,
    #[serde(rename = "DBClusterParameterGroupName")]
    pub db_cluster_parameter_group_name: Option<String>,
    #[serde(rename = "DBSubnetGroupName")]
    pub db_subnet_group_name: Option<String>,
    pub engine: Option<String>,
    pub engine_version: Option<String>,
    pub kms_key_id: Option<String>,
    pub option_group_name: Option<String>,
    pub port: Option<i32>,
    pub preferred_backup_window: Option<String>,
    pub preferred_maintenance_window: Option<String>,
    pub storage_encrypted: Option<bool>,
}

fn api_err(err: impl std::fmt::Debug) -> ProviderError {
    ProviderError::Api(format!("{err:?}"))
}

pub struct AwsClusteredProvider {
    client: Client,
    instances: AwsInstanceProvider,
    name_prefix: String,
    vpc_security_group: String,
}

impl AwsClusteredProvider {
    pub async fn new(name_prefix: &str) -> Result<Self, ProviderError> {
        let region = std::env::var("AWS_REGION").map_err(|_| {
            ProviderError::Config("Unable to find AWS_REGION environment variable.".to_string())
        })?;
        let vpc_security_group = std::env::var("AWS_VPC_SECURITY_GROUPS").map_err(|_| {
            ProviderError::Config(
                "Unable to find AWS_VPC_SECURITY_GROUPS environment variable.".to_string(),
            )
        })?;
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&config),
            instances: AwsInstanceProvider::new(name_prefix).await?,
            name_prefix: name_prefix.to_string(),
            vpc_security_group,
        })
    }

    fn settings_for(plan: &Plan) -> Result<RdsClusterSettings, ProviderError> {
        Ok(serde_json::from_str(plan.provider_private_details())?)
    }

    async fn describe_cluster(
        &self,
        name: &str,
    ) -> Result<aws_sdk_rds::types::DbCluster, ProviderError> {
        let resp = self
            .client
            .describe_db_clusters()
            .db_cluster_identifier(name)
            .send()
            .await
            .map_err(api_err)?;
        resp.db_clusters()
            .first()
            .cloned()
            .ok_or(ProviderError::NotFound)
    }

    async fn wait_until_cluster_available(
        &self,
        name: &str,
        max_polls: usize,
    ) -> Result<(), ProviderError> {
        for _ in 0..max_polls {
            let cluster = self.describe_cluster(name).await?;
            if cluster.status() == Some("available") {
                return Ok(());
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
        Err(ProviderError::Api(format!(
            "cluster {name} did not become available in time"
        )))
    }

    /// Cluster members, readers first, writers last.
    async fn members_writers_last(&self, name: &str) -> Result<Vec<String>, ProviderError> {
        let cluster = self.describe_cluster(name).await?;
        let mut readers = Vec::new();
        let mut writers = Vec::new();
        for member in cluster.db_cluster_members() {
            let Some(id) = member.db_instance_identifier() else {
                continue;
            };
            if member.is_cluster_writer().unwrap_or(false) {
                writers.push(id.to_string());
            } else {
                readers.push(id.to_string());
            }
        }
        readers.extend(writers);
        Ok(readers)
    }
}

#[async_trait]
impl Provider for AwsClusteredProvider {
    async fn get_instance(&self, name: &str, plan: &Plan) -> Result<Instance, ProviderError> {
        self.instances.get_instance(name, plan).await
    }

    async fn provision(&self, id: &str, plan: &Plan, owner: &str)
        -> Result<Instance, ProviderError> {
        let settings = Self::settings_for(plan)?;

        let name = format!("{}{}", self.name_prefix.to_lowercase(), random_name(8));
        let username = format!("u{}", random_name(8));
        let password = random_password(16);

        self.client
            .create_db_cluster()
            .database_name(&name)
            .db_cluster_identifier(&name)
            .master_username(&username)
            .master_user_password(&password)
            .tags(Tag::builder().key("BillingCode").value(owner).build())
            .vpc_security_group_ids(self.vpc_security_group.clone())
            .set_backtrack_window(settings.cluster.backtrack_window)
            .set_backup_retention_period(settings.cluster.backup_retention_period)
            .set_db_cluster_parameter_group_name(
                settings.cluster.db_cluster_parameter_group_name.clone(),
            )
            .set_db_subnet_group_name(settings.cluster.db_subnet_group_name.clone())
            .set_engine(settings.cluster.engine.clone())
            .set_engine_version(settings.cluster.engine_version.clone())
            .set_kms_key_id(settings.cluster.kms_key_id.clone())
            .set_option_group_name(settings.cluster.option_group_name.clone())
            .set_port(settings.cluster.port)
            .set_preferred_backup_window(settings.cluster.preferred_backup_window.clone())
            .set_preferred_maintenance_window(
                settings.cluster.preferred_maintenance_window.clone(),
            )
            .set_storage_encrypted(settings.cluster.storage_encrypted)
            .send()
            .await
            .map_err(api_err)?;

        // Member credentials and storage are managed by the cluster.
        let mut instance = self
            .instances
            .provision_with_settings(
                id,
                plan,
                &settings.instance,
                RdsCreateSpec {
                    name: &name,
                    username: None,
                    password: None,
                    cluster_identifier: Some(&name),
                    owner,
                },
            )
            .await?;
        instance.username = username;
        instance.password = password;
        Ok(instance)
    }

    async fn deprovision(
        &self,
        instance: &Instance,
        take_snapshot: bool,
    ) -> Result<(), ProviderError> {
        for member in self.members_writers_last(&instance.name).await? {
            self.client
                .delete_db_instance()
                .db_instance_identifier(&member)
                .skip_final_snapshot(true)
                .send()
                .await
                .map_err(api_err)?;
        }
        let mut req = self
            .client
            .delete_db_cluster()
            .db_cluster_identifier(&instance.name)
            .skip_final_snapshot(!take_snapshot);
        if take_snapshot {
            req = req.final_db_snapshot_identifier(format!("{}-final", instance.name));
        }
        req.send().await.map_err(api_err)?;
        Ok(())
    }

    async fn modify(&self, instance: &Instance, plan: &Plan) -> Result<Instance, ProviderError> {
        if instance.status != "available" {
            return Err(ProviderError::Unavailable(
                "Databases cannot be modified while being created, under maintenance or destroyed."
                    .to_string(),
            ));
        }
        let settings = Self::settings_for(plan)?;
        self.client
            .modify_db_cluster()
            .db_cluster_identifier(&instance.name)
            .apply_immediately(true)
            .vpc_security_group_ids(self.vpc_security_group.clone())
            .set_backtrack_window(settings.cluster.backtrack_window)
            .set_backup_retention_period(settings.cluster.backup_retention_period)
            .set_db_cluster_parameter_group_name(
                settings.cluster.db_cluster_parameter_group_name.clone(),
            )
            .set_engine_version(settings.cluster.engine_version.clone())
            .set_option_group_name(settings.cluster.option_group_name.clone())
            .set_port(settings.cluster.port)
            .set_preferred_backup_window(settings.cluster.preferred_backup_window.clone())
            .set_preferred_maintenance_window(
                settings.cluster.preferred_maintenance_window.clone(),
            )
            .send()
            .await
            .map_err(api_err)?;
        self.instances
            .modify_with_settings(instance, plan, &settings.instance)
            .await
    }

    async fn tag(&self, instance: &Instance, name: &str, value: &str)
        -> Result<(), ProviderError> {
        self.instances.tag(instance, name, value).await
    }

    async fn untag(&self, instance: &Instance, name: &str) -> Result<(), ProviderError> {
        self.instances.untag(instance, name).await
    }

    async fn get_backup(&self, instance: &Instance, id: &str) -> Result<BackupSpec, ProviderError> {
        self.instances.get_backup(instance, id).await
    }

    async fn list_backups(&self, instance: &Instance) -> Result<Vec<BackupSpec>, ProviderError> {
        self.instances.list_backups(instance).await
    }

    async fn create_backup(&self, instance: &Instance) -> Result<BackupSpec, ProviderError> {
        self.instances.create_backup(instance).await
    }

    async fn restore_backup(&self, instance: &Instance, id: &str) -> Result<(), ProviderError> {
        if !instance.ready {
            return Err(ProviderError::Unavailable(
                "Cannot restore a backup on a database that is unavailable.".to_string(),
            ));
        }
        let settings = Self::settings_for(&instance.plan)?;
        let name = instance.name.clone();
        let suffix = random_name(5);

        // Step 1: move the live cluster and its members out of the way.
        let members = self.members_writers_last(&name).await?;
        for member in &members {
            self.client
                .modify_db_instance()
                .db_instance_identifier(member)
                .new_db_instance_identifier(format!("{member}-{suffix}"))
                .apply_immediately(true)
                .send()
                .await
                .map_err(api_err)?;
        }
        self.client
            .modify_db_cluster()
            .db_cluster_identifier(&name)
            .new_db_cluster_identifier(format!("{name}-{suffix}"))
            .apply_immediately(true)
            .send()
            .await
            .map_err(api_err)?;
        tokio::time::sleep(WAIT_POLL).await;
        self.wait_until_cluster_available(&format!("{name}-{suffix}"), 60)
            .await?;

        // Step 2: restore the snapshot under the original name.
        self.client
            .restore_db_cluster_from_snapshot()
            .db_cluster_identifier(&name)
            .snapshot_identifier(id)
            .set_engine(settings.cluster.engine.clone())
            .set_db_subnet_group_name(settings.cluster.db_subnet_group_name.clone())
            .vpc_security_group_ids(self.vpc_security_group.clone())
            .send()
            .await
            .map_err(api_err)?;

        // Step 3: a restored cluster has no members; recreate the writer.
        self.instances
            .provision_with_settings(
                &instance.id,
                &instance.plan,
                &settings.instance,
                RdsCreateSpec {
                    name: &name,
                    username: None,
                    password: None,
                    cluster_identifier: Some(&name),
                    owner: "restored",
                },
            )
            .await?;
        self.wait_until_cluster_available(&name, 60).await?;

        // Step 4: the suffixed cluster is garbage now; remove it off the hot
        // path.
        let client = self.client.clone();
        let old_cluster = format!("{name}-{suffix}");
        let old_members: Vec<String> =
            members.iter().map(|m| format!("{m}-{suffix}")).collect();
        tokio::spawn(async move {
            for member in old_members {
                if let Err(err) = client
                    .delete_db_instance()
                    .db_instance_identifier(&member)
                    .skip_final_snapshot(true)
                    .send()
                    .await
                {
                    error!(member = %member, error = ?err, "unable to delete renamed cluster member after restore");
                }
            }
            if let Err(err) = client
                .delete_db_cluster()
                .db_cluster_identifier(&old_cluster)
                .skip_final_snapshot(true)
                .send()
                .await
            {
                error!(cluster = %old_cluster, error = ?err, "unable to delete renamed cluster after restore");
            }
        });
        Ok(())
    }

    async fn restart(&self, instance: &Instance) -> Result<(), ProviderError> {
        self.instances.restart(instance).await
    }

    async fn list_logs(&self, instance: &Instance) -> Result<Vec<LogFileSpec>, ProviderError> {
        self.instances.list_logs(instance).await
    }

    async fn get_logs(&self, instance: &Instance, path: &str) -> Result<String, ProviderError> {
        self.instances.get_logs(instance, path).await
    }

    async fn create_read_only_user(
        &self,
        instance: &Instance,
    ) -> Result<DatabaseUrl, ProviderError> {
        self.instances.create_read_only_user(instance).await
    }

    async fn delete_read_only_user(
        &self,
        instance: &Instance,
        role: &str,
    ) -> Result<(), ProviderError> {
        self.instances.delete_read_only_user(instance, role).await
    }

    async fn rotate_password_read_only_user(
        &self,
        instance: &Instance,
        role: &str,
    ) -> Result<DatabaseUrl, ProviderError> {
        self.instances
            .rotate_password_read_only_user(instance, role)
            .await
    }

    async fn create_read_replica(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        if instance.status != "available" {
            return Err(ProviderError::Unavailable(
                "Replicas cannot be created for databases being created, under maintenance or destroyed."
                    .to_string(),
            ));
        }
        let settings = Self::settings_for(&instance.plan)?;
        // A cluster replica is just another member.
        let mut replica = self
            .instances
            .provision_with_settings(
                &format!("{}-ro", instance.name),
                &instance.plan,
                &settings.instance,
                RdsCreateSpec {
                    name: &format!("{}-ro", instance.name),
                    username: None,
                    password: None,
                    cluster_identifier: Some(&instance.name),
                    owner: "replica",
                },
            )
            .await?;
        replica.username = instance.username.clone();
        replica.password = instance.password.clone();
        replica.scheme = instance.scheme.clone();
        Ok(replica)
    }

    async fn get_read_replica(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        self.instances.get_read_replica(instance).await
    }

    async fn delete_read_replica(&self, instance: &Instance) -> Result<(), ProviderError> {
        self.instances.delete_read_replica(instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_settings_parse_nested_templates() {
        let settings: RdsClusterSettings = serde_json::from_str(
            r#"{"Instance":{"DBInstanceClass":"db.r5.large","Engine":"aurora-mysql"},
                "Cluster":{"BackupRetentionPeriod":14,"Engine":"aurora-mysql","StorageEncrypted":true}}"#,
        )
        .unwrap();
        assert_eq!(
            settings.instance.db_instance_class.as_deref(),
            Some("db.r5.large")
        );
        assert_eq!(settings.cluster.backup_retention_period, Some(14));
        assert_eq!(settings.cluster.storage_encrypted, Some(true));
    }
}
