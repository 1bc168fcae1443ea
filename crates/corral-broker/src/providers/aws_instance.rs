// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed single-node RDS provider.
//!
//! Three operations here are multi-step state machines rather than single API
//! calls and are encoded as explicit step lists with bounded wait loops:
//!
//! - restore: rename the live instance aside, restore the snapshot under the
//!   original name, re-attach security groups and parameter group (the API
//!   does not preserve them on restore), then delete the renamed orphan.
//! - major version upgrade: the API only advertises a bounded set of upgrade
//!   targets per version, so upgrades are planned as a hop sequence.
//! - deprovision: the read replica goes first, then the primary with its
//!   final snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_rds::types::Tag;
use aws_sdk_rds::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use corral_store::models::{BackupSpec, DatabaseSpec, DatabaseUrl, Instance, LogFileSpec, Plan};
use corral_store::status;

use super::roles::{
    create_postgres_readonly_role, delete_postgres_readonly_role, rotate_postgres_readonly_role,
};
use super::{compose_url, random_name, random_password, Provider, ProviderError};

/// How long a cached `get_instance` answer may be served.
const CACHE_TTL: Duration = Duration::from_secs(30);
/// Pause between wait-loop polls against the backend.
const WAIT_POLL: Duration = Duration::from_secs(30);
/// Pause after an upgrade hop so the backend registers the state change.
const UPGRADE_SETTLE: Duration = Duration::from_secs(10);
/// Upper bound on planned upgrade hops.
const MAX_UPGRADE_STEPS: usize = 10;

/// Backend-specific creation template stored on the plan row.
///
/// Field names match the backend's wire casing so operators can paste
/// templates straight from API documentation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RdsInstanceSettings {
    pub allocated_storage: Option<i32>,
    pub auto_minor_version_upgrade: Option<bool>,
    pub backup_retention_period: Option<i32>,
    pub copy_tags_to_snapshot: Option<bool>,
    #[serde(rename = "DBInstanceClass")]
    pub db_instance_class: Option<String>,
    #[serde(rename = "DBParameterGroupName")]
    pub db_parameter_group_name: Option<String>,
    #[serde(rename = "DBSubnetGroupName")]
    pub db_subnet_group_name: Option<String>,
    pub engine: Option<String>,
    pub engine_version: Option<String>,
    pub enable_performance_insights: Option<bool>,
    pub iops: Option<i32>,
    pub kms_key_id: Option<String>,
    #[serde(rename = "MultiAZ")]
    pub multi_az: Option<bool>,
    pub port: Option<i32>,
    pub publicly_accessible: Option<bool>,
    pub storage_encrypted: Option<bool>,
    pub storage_type: Option<String>,
}

impl RdsInstanceSettings {
    pub(crate) fn parse(details: &str) -> Result<Self, ProviderError> {
        Ok(serde_json::from_str(details)?)
    }
}

/// Identifier overrides used when a creation is driven by another provider
/// (cluster members, read replicas of cluster plans).
pub(crate) struct RdsCreateSpec<'a> {
    pub name: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub cluster_identifier: Option<&'a str>,
    pub owner: &'a str,
}

fn api_err(err: impl std::fmt::Debug) -> ProviderError {
    ProviderError::Api(format!("{err:?}"))
}

/// Parse "major.minor.patch" leniently; missing parts are zero.
pub(crate) fn parse_version(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.').map(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u64>()
            .unwrap_or(0)
    });
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Pick the next hop from the advertised upgrade targets: the exact proposed
/// version if offered, otherwise the highest-listed target.
pub(crate) fn next_upgrade_step(targets: &[String], proposed: &str) -> Option<String> {
    if targets.iter().any(|t| t == proposed) {
        return Some(proposed.to_string());
    }
    targets
        .iter()
        .max_by_key(|t| parse_version(t))
        .map(|t| t.to_string())
}

/// Append a hop to the plan, refusing fixed points, duplicates and runaway
/// plans.
pub(crate) fn push_upgrade_step(
    plan: &mut Vec<String>,
    current: &str,
    next: String,
) -> Result<(), ProviderError> {
    if next == current {
        return Err(ProviderError::Api(format!(
            "upgrade planning reached a fixed point at version {next}"
        )));
    }
    if plan.iter().any(|step| *step == next) {
        return Err(ProviderError::Api(format!(
            "upgrade planning proposed version {next} twice"
        )));
    }
    plan.push(next);
    if plan.len() > MAX_UPGRADE_STEPS {
        return Err(ProviderError::Api(format!(
            "upgrade plan exceeded {MAX_UPGRADE_STEPS} steps"
        )));
    }
    Ok(())
}

fn format_timestamp(secs: Option<i64>) -> String {
    secs.and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub struct AwsInstanceProvider {
    client: Client,
    name_prefix: String,
    vpc_security_group: String,
    cache: Arc<Mutex<HashMap<String, (std::time::Instant, Instance)>>>,
}

impl AwsInstanceProvider {
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

        let cache: Arc<Mutex<HashMap<String, (std::time::Instant, Instance)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let sweeper = cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_TTL);
            loop {
                ticker.tick().await;
                sweeper.lock().await.clear();
            }
        });

        Ok(Self {
            client: Client::new(&config),
            name_prefix: name_prefix.to_string(),
            vpc_security_group,
            cache,
        })
    }

    fn settings_for(plan: &Plan) -> Result<RdsInstanceSettings, ProviderError> {
        RdsInstanceSettings::parse(plan.provider_private_details())
    }

    fn master_url(instance: &Instance) -> String {
        compose_url(
            &instance.scheme,
            &instance.username,
            &instance.password,
            &instance.endpoint,
        )
    }

    async fn describe(&self, name: &str) -> Result<aws_sdk_rds::types::DbInstance, ProviderError> {
        let resp = self
            .client
            .describe_db_instances()
            .db_instance_identifier(name)
            .max_records(20)
            .send()
            .await
            .map_err(api_err)?;
        resp.db_instances()
            .first()
            .cloned()
            .ok_or(ProviderError::NotFound)
    }

    fn instance_from(db: &aws_sdk_rds::types::DbInstance, name: &str, plan: &Plan) -> Instance {
        let endpoint = db
            .endpoint()
            .and_then(|e| match (e.address(), e.port()) {
                (Some(address), Some(port)) => Some(format!("{address}:{port}/{name}")),
                _ => None,
            })
            .unwrap_or_default();
        let db_status = db.db_instance_status().unwrap_or("unknown").to_string();
        Instance {
            // Secrets and the broker-side id are never sourced from the
            // backend; the resolver grafts them on from the registry row.
            id: String::new(),
            name: name.to_string(),
            provider_id: db.db_instance_arn().unwrap_or_default().to_string(),
            plan: plan.clone(),
            username: String::new(),
            password: String::new(),
            endpoint,
            ready: status::is_ready(&db_status),
            status: db_status,
            engine: db.engine().unwrap_or_default().to_string(),
            engine_version: db.engine_version().unwrap_or_default().to_string(),
            scheme: plan.scheme.clone(),
        }
    }

    pub(crate) async fn provision_with_settings(
        &self,
        id: &str,
        plan: &Plan,
        settings: &RdsInstanceSettings,
        spec: RdsCreateSpec<'_>,
    ) -> Result<Instance, ProviderError> {
        let mut req = self
            .client
            .create_db_instance()
            .db_name(spec.name)
            .db_instance_identifier(spec.name)
            .tags(Tag::builder().key("BillingCode").value(spec.owner).build())
            .vpc_security_group_ids(self.vpc_security_group.clone());
        if let Some(username) = spec.username {
            req = req.master_username(username);
        }
        if let Some(password) = spec.password {
            req = req.master_user_password(password);
        }
        if let Some(cluster) = spec.cluster_identifier {
            req = req.db_cluster_identifier(cluster);
        }
        let resp = req
            .set_allocated_storage(settings.allocated_storage)
            .set_auto_minor_version_upgrade(settings.auto_minor_version_upgrade)
            .set_backup_retention_period(settings.backup_retention_period)
            .set_copy_tags_to_snapshot(settings.copy_tags_to_snapshot)
            .set_db_instance_class(settings.db_instance_class.clone())
            .set_db_parameter_group_name(settings.db_parameter_group_name.clone())
            .set_db_subnet_group_name(settings.db_subnet_group_name.clone())
            .set_engine(settings.engine.clone())
            .set_engine_version(settings.engine_version.clone())
            .set_enable_performance_insights(settings.enable_performance_insights)
            .set_iops(settings.iops)
            .set_kms_key_id(settings.kms_key_id.clone())
            .set_multi_az(settings.multi_az)
            .set_port(settings.port)
            .set_publicly_accessible(settings.publicly_accessible)
            .set_storage_encrypted(settings.storage_encrypted)
            .set_storage_type(settings.storage_type.clone())
            .send()
            .await
            .map_err(api_err)?;

        let db = resp.db_instance().ok_or_else(|| {
            ProviderError::Api("create returned no instance description".to_string())
        })?;
        let mut instance = Self::instance_from(db, spec.name, plan);
        instance.id = id.to_string();
        instance.username = db
            .master_username()
            .or(spec.username)
            .unwrap_or_default()
            .to_string();
        Ok(instance)
    }

    pub(crate) async fn modify_with_settings(
        &self,
        instance: &Instance,
        plan: &Plan,
        settings: &RdsInstanceSettings,
    ) -> Result<Instance, ProviderError> {
        let resp = self
            .client
            .modify_db_instance()
            .db_instance_identifier(&instance.name)
            .apply_immediately(true)
            .set_allocated_storage(settings.allocated_storage)
            .set_auto_minor_version_upgrade(settings.auto_minor_version_upgrade)
            .set_backup_retention_period(settings.backup_retention_period)
            .set_copy_tags_to_snapshot(settings.copy_tags_to_snapshot)
            .set_db_instance_class(settings.db_instance_class.clone())
            .set_db_parameter_group_name(settings.db_parameter_group_name.clone())
            .set_engine_version(settings.engine_version.clone())
            .set_iops(settings.iops)
            .set_multi_az(settings.multi_az)
            .set_publicly_accessible(settings.publicly_accessible)
            .set_storage_type(settings.storage_type.clone())
            .send()
            .await
            .map_err(api_err)?;

        let db = resp.db_instance().ok_or_else(|| {
            ProviderError::Api("modify returned no instance description".to_string())
        })?;
        let mut updated = Self::instance_from(db, &instance.name, plan);
        updated.id = instance.id.clone();
        updated.username = instance.username.clone();
        updated.password = instance.password.clone();
        if updated.endpoint.is_empty() {
            updated.endpoint = instance.endpoint.clone();
        }
        Ok(updated)
    }

    async fn wait_until_available(&self, name: &str, max_polls: usize) -> Result<(), ProviderError> {
        for _ in 0..max_polls {
            let db = self.describe(name).await?;
            if db.db_instance_status() == Some("available") {
                return Ok(());
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
        Err(ProviderError::Api(format!(
            "instance {name} did not become available in time"
        )))
    }

    async fn fetch_upgrade_targets(
        &self,
        engine: &str,
        version: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let resp = self
            .client
            .describe_db_engine_versions()
            .engine(engine)
            .engine_version(version)
            .send()
            .await
            .map_err(api_err)?;
        Ok(resp
            .db_engine_versions()
            .iter()
            .flat_map(|v| v.valid_upgrade_target())
            .filter_map(|t| t.engine_version())
            .map(str::to_string)
            .collect())
    }

    /// Plan the hop sequence from `current` to `proposed`.
    async fn plan_upgrade_path(
        &self,
        engine: &str,
        current: &str,
        proposed: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let mut plan = Vec::new();
        let mut at = current.to_string();
        loop {
            let targets = self.fetch_upgrade_targets(engine, &at).await?;
            let next = next_upgrade_step(&targets, proposed).ok_or_else(|| {
                ProviderError::Api(format!("no upgrade targets advertised from version {at}"))
            })?;
            push_upgrade_step(&mut plan, &at, next.clone())?;
            if next == proposed {
                return Ok(plan);
            }
            at = next;
        }
    }

    /// Parameter group for an upgrade hop: prefer the plan-specified group,
    /// then the default group for the target family, then any matching group.
    async fn choose_parameter_group(
        &self,
        settings: &RdsInstanceSettings,
        engine: &str,
        version: &str,
    ) -> Option<String> {
        if let Some(group) = &settings.db_parameter_group_name {
            return Some(group.clone());
        }
        let (major, minor, _) = parse_version(version);
        let family = if major >= 10 {
            format!("{engine}{major}")
        } else {
            format!("{engine}{major}.{minor}")
        };
        let groups = self
            .client
            .describe_db_parameter_groups()
            .send()
            .await
            .ok()?;
        let matching: Vec<_> = groups
            .db_parameter_groups()
            .iter()
            .filter(|g| g.db_parameter_group_family() == Some(family.as_str()))
            .collect();
        matching
            .iter()
            .find(|g| {
                g.db_parameter_group_name()
                    .is_some_and(|n| n.starts_with("default."))
            })
            .or_else(|| matching.first())
            .and_then(|g| g.db_parameter_group_name())
            .map(str::to_string)
    }

    /// Walk the planned hop sequence, one modify per hop.
    async fn upgrade_engine_version(
        &self,
        instance: &Instance,
        settings: &RdsInstanceSettings,
        proposed: &str,
    ) -> Result<(), ProviderError> {
        let path = self
            .plan_upgrade_path(&instance.engine, &instance.engine_version, proposed)
            .await?;
        info!(
            name = %instance.name,
            from = %instance.engine_version,
            to = %proposed,
            hops = path.len(),
            "planned engine version upgrade"
        );
        for step in path {
            self.wait_until_available(&instance.name, 60).await?;
            let group = self
                .choose_parameter_group(settings, &instance.engine, &step)
                .await;
            self.client
                .modify_db_instance()
                .db_instance_identifier(&instance.name)
                .engine_version(&step)
                .allow_major_version_upgrade(true)
                .apply_immediately(true)
                .set_db_parameter_group_name(group)
                .send()
                .await
                .map_err(api_err)?;
            // Give the backend a moment to leave "available" before the next
            // wait loop reads it.
            tokio::time::sleep(UPGRADE_SETTLE).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for AwsInstanceProvider {
    async fn get_instance(&self, name: &str, plan: &Plan) -> Result<Instance, ProviderError> {
        let key = format!("{name}{}", plan.id);
        if let Some((at, cached)) = self.cache.lock().await.get(&key) {
            if at.elapsed() < CACHE_TTL {
                return Ok(cached.clone());
            }
        }
        let db = self.describe(name).await?;
        let instance = Self::instance_from(&db, name, plan);
        self.cache
            .lock()
            .await
            .insert(key, (std::time::Instant::now(), instance.clone()));
        Ok(instance)
    }

    async fn provision(&self, id: &str, plan: &Plan, owner: &str)
        -> Result<Instance, ProviderError> {
        let settings = Self::settings_for(plan)?;
        let name = format!("{}{}", self.name_prefix.to_lowercase(), random_name(8));
        let username = format!("u{}", random_name(8));
        let password = random_password(16);
        let mut instance = self
            .provision_with_settings(
                id,
                plan,
                &settings,
                RdsCreateSpec {
                    name: &name,
                    username: Some(&username),
                    password: Some(&password),
                    cluster_identifier: None,
                    owner,
                },
            )
            .await?;
        // The generated plaintext password exists only in this return value.
        instance.password = password;
        Ok(instance)
    }

    async fn deprovision(
        &self,
        instance: &Instance,
        take_snapshot: bool,
    ) -> Result<(), ProviderError> {
        // Best effort: a replica may or may not exist.
        let _ = self
            .client
            .delete_db_instance()
            .db_instance_identifier(format!("{}-ro", instance.name))
            .skip_final_snapshot(true)
            .send()
            .await;

        let mut req = self
            .client
            .delete_db_instance()
            .db_instance_identifier(&instance.name)
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
        if let Some(proposed) = settings.engine_version.clone() {
            let (current_major, ..) = parse_version(&instance.engine_version);
            let (proposed_major, ..) = parse_version(&proposed);
            if proposed_major > current_major {
                self.upgrade_engine_version(instance, &settings, &proposed)
                    .await?;
                self.wait_until_available(&instance.name, 60).await?;
            }
        }
        self.modify_with_settings(instance, plan, &settings).await
    }

    async fn tag(&self, instance: &Instance, name: &str, value: &str)
        -> Result<(), ProviderError> {
        self.client
            .add_tags_to_resource()
            .resource_name(&instance.provider_id)
            .tags(Tag::builder().key(name).value(value).build())
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn untag(&self, instance: &Instance, name: &str) -> Result<(), ProviderError> {
        self.client
            .remove_tags_from_resource()
            .resource_name(&instance.provider_id)
            .tag_keys(name)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn get_backup(&self, instance: &Instance, id: &str) -> Result<BackupSpec, ProviderError> {
        let resp = self
            .client
            .describe_db_snapshots()
            .db_instance_identifier(&instance.name)
            .db_snapshot_identifier(id)
            .send()
            .await
            .map_err(api_err)?;
        let snapshots = resp.db_snapshots();
        if snapshots.len() != 1 {
            return Err(ProviderError::NotFound);
        }
        let snapshot = &snapshots[0];
        Ok(BackupSpec {
            database: DatabaseSpec {
                name: instance.name.clone(),
            },
            id: snapshot.db_snapshot_identifier().map(str::to_string),
            progress: snapshot.percent_progress().map(i64::from),
            status: snapshot.status().map(str::to_string),
            created: format_timestamp(snapshot.snapshot_create_time().map(|t| t.secs())),
        })
    }

    async fn list_backups(&self, instance: &Instance) -> Result<Vec<BackupSpec>, ProviderError> {
        let resp = self
            .client
            .describe_db_snapshots()
            .db_instance_identifier(&instance.name)
            .send()
            .await
            .map_err(api_err)?;
        Ok(resp
            .db_snapshots()
            .iter()
            .map(|snapshot| BackupSpec {
                database: DatabaseSpec {
                    name: instance.name.clone(),
                },
                id: snapshot.db_snapshot_identifier().map(str::to_string),
                progress: snapshot.percent_progress().map(i64::from),
                status: snapshot.status().map(str::to_string),
                created: format_timestamp(snapshot.snapshot_create_time().map(|t| t.secs())),
            })
            .collect())
    }

    async fn create_backup(&self, instance: &Instance) -> Result<BackupSpec, ProviderError> {
        if !instance.ready {
            return Err(ProviderError::Unavailable(
                "Cannot create a backup on a database that is unavailable.".to_string(),
            ));
        }
        let snapshot_name = format!("{}-manual-{}", instance.name, random_name(10));
        let resp = self
            .client
            .create_db_snapshot()
            .db_instance_identifier(&instance.name)
            .db_snapshot_identifier(snapshot_name)
            .send()
            .await
            .map_err(api_err)?;
        let snapshot = resp
            .db_snapshot()
            .ok_or_else(|| ProviderError::Api("create returned no snapshot".to_string()))?;
        Ok(BackupSpec {
            database: DatabaseSpec {
                name: instance.name.clone(),
            },
            id: snapshot.db_snapshot_identifier().map(str::to_string),
            progress: snapshot.percent_progress().map(i64::from),
            status: snapshot.status().map(str::to_string),
            created: format_timestamp(snapshot.snapshot_create_time().map(|t| t.secs())),
        })
    }

    async fn restore_backup(&self, instance: &Instance, id: &str) -> Result<(), ProviderError> {
        if !instance.ready {
            return Err(ProviderError::Unavailable(
                "Cannot restore a backup on a database that is unavailable.".to_string(),
            ));
        }
        let settings = Self::settings_for(&instance.plan)?;

        // Capture the security groups up front; the restore call cannot carry
        // them and the restored instance comes back without them.
        let db = self.describe(&instance.name).await?;
        let security_groups: Vec<String> = db
            .vpc_security_groups()
            .iter()
            .filter_map(|g| g.vpc_security_group_id())
            .map(str::to_string)
            .collect();

        let renamed = format!("{}-restore-{}", instance.name, random_name(5));
        self.client
            .modify_db_instance()
            .db_instance_identifier(&instance.name)
            .new_db_instance_identifier(&renamed)
            .apply_immediately(true)
            .send()
            .await
            .map_err(api_err)?;
        tokio::time::sleep(UPGRADE_SETTLE).await;
        self.wait_until_available(&renamed, 60).await?;

        self.client
            .restore_db_instance_from_db_snapshot()
            .db_instance_identifier(&instance.name)
            .db_snapshot_identifier(id)
            .set_db_subnet_group_name(settings.db_subnet_group_name.clone())
            .send()
            .await
            .map_err(api_err)?;
        self.wait_until_available(&instance.name, 60).await?;

        self.client
            .modify_db_instance()
            .db_instance_identifier(&instance.name)
            .apply_immediately(true)
            .set_vpc_security_group_ids(Some(security_groups))
            .set_db_parameter_group_name(settings.db_parameter_group_name.clone())
            .send()
            .await
            .map_err(api_err)?;

        // The renamed original is garbage now; remove it off the hot path.
        let client = self.client.clone();
        tokio::spawn(async move {
            for _ in 0..60usize {
                match client
                    .describe_db_instances()
                    .db_instance_identifier(&renamed)
                    .send()
                    .await
                {
                    Ok(resp)
                        if resp
                            .db_instances()
                            .first()
                            .and_then(|d| d.db_instance_status())
                            == Some("available") =>
                    {
                        break
                    }
                    Ok(_) => tokio::time::sleep(WAIT_POLL).await,
                    Err(err) => {
                        error!(instance = %renamed, error = ?err, "unable to poll renamed instance before cleanup");
                        return;
                    }
                }
            }
            if let Err(err) = client
                .delete_db_instance()
                .db_instance_identifier(&renamed)
                .skip_final_snapshot(true)
                .send()
                .await
            {
                error!(instance = %renamed, error = ?err, "unable to clean up renamed instance after restore");
            }
        });
        Ok(())
    }

    async fn restart(&self, instance: &Instance) -> Result<(), ProviderError> {
        // Restart applies to the primary only.
        if !instance.ready {
            return Err(ProviderError::Unavailable(
                "Cannot restart a database that is unavailable.".to_string(),
            ));
        }
        self.client
            .reboot_db_instance()
            .db_instance_identifier(&instance.name)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn list_logs(&self, instance: &Instance) -> Result<Vec<LogFileSpec>, ProviderError> {
        let week_ago = (chrono::Utc::now() - chrono::Duration::days(7)).timestamp();
        let resp = self
            .client
            .describe_db_log_files()
            .db_instance_identifier(&instance.name)
            .file_last_written(week_ago)
            .max_records(100)
            .send()
            .await
            .map_err(api_err)?;
        Ok(resp
            .describe_db_log_files()
            .iter()
            .map(|log| LogFileSpec {
                name: log.log_file_name().map(str::to_string),
                size: log.size(),
                // The backend reports milliseconds since epoch.
                updated: format_timestamp(log.last_written().map(|ms| ms / 1000)),
            })
            .collect())
    }

    async fn get_logs(&self, instance: &Instance, path: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .download_db_log_file_portion()
            .db_instance_identifier(&instance.name)
            .log_file_name(path)
            .send()
            .await
            .map_err(api_err)?;
        Ok(resp.log_file_data().unwrap_or_default().to_string())
    }

    async fn create_read_only_user(
        &self,
        instance: &Instance,
    ) -> Result<DatabaseUrl, ProviderError> {
        if !instance.ready {
            return Err(ProviderError::Unavailable(
                "Cannot create a user on a database that is unavailable.".to_string(),
            ));
        }
        create_postgres_readonly_role(instance, &Self::master_url(instance)).await
    }

    async fn delete_read_only_user(
        &self,
        instance: &Instance,
        role: &str,
    ) -> Result<(), ProviderError> {
        if !instance.ready {
            return Err(ProviderError::Unavailable(
                "Cannot delete a user on a database that is unavailable.".to_string(),
            ));
        }
        delete_postgres_readonly_role(instance, &Self::master_url(instance), role).await
    }

    async fn rotate_password_read_only_user(
        &self,
        instance: &Instance,
        role: &str,
    ) -> Result<DatabaseUrl, ProviderError> {
        if !instance.ready {
            return Err(ProviderError::Unavailable(
                "Cannot rotate a password on a database that is unavailable.".to_string(),
            ));
        }
        rotate_postgres_readonly_role(instance, &Self::master_url(instance), role).await
    }

    async fn create_read_replica(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        if instance.status != "available" {
            return Err(ProviderError::Unavailable(
                "Replicas cannot be created for databases being created, under maintenance or destroyed."
                    .to_string(),
            ));
        }
        let settings = Self::settings_for(&instance.plan)?;
        let replica_name = format!("{}-ro", instance.name);
        let resp = self
            .client
            .create_db_instance_read_replica()
            .source_db_instance_identifier(&instance.name)
            .db_instance_identifier(&replica_name)
            .tags(Tag::builder().key("Name").value(&instance.name).build())
            .set_db_instance_class(settings.db_instance_class.clone())
            .set_auto_minor_version_upgrade(settings.auto_minor_version_upgrade)
            .set_multi_az(settings.multi_az)
            .set_publicly_accessible(settings.publicly_accessible)
            .set_port(settings.port)
            .set_copy_tags_to_snapshot(settings.copy_tags_to_snapshot)
            .set_kms_key_id(settings.kms_key_id.clone())
            .set_db_subnet_group_name(settings.db_subnet_group_name.clone())
            .set_enable_performance_insights(settings.enable_performance_insights)
            .set_performance_insights_kms_key_id(settings.kms_key_id.clone())
            .set_storage_type(settings.storage_type.clone())
            .set_iops(settings.iops)
            .send()
            .await
            .map_err(api_err)?;

        let db = resp.db_instance().ok_or_else(|| {
            ProviderError::Api("replica create returned no instance description".to_string())
        })?;
        let mut replica = Self::instance_from(db, &instance.name, &instance.plan);
        replica.id = replica_name;
        // Replica credentials mirror the primary's; replica-local users are
        // not supported by the backend.
        replica.username = instance.username.clone();
        replica.password = instance.password.clone();
        replica.scheme = instance.scheme.clone();
        Ok(replica)
    }

    async fn get_read_replica(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        let mut replica = self
            .get_instance(&format!("{}-ro", instance.name), &instance.plan)
            .await?;
        replica.username = instance.username.clone();
        replica.password = instance.password.clone();
        Ok(replica)
    }

    async fn delete_read_replica(&self, instance: &Instance) -> Result<(), ProviderError> {
        self.client
            .delete_db_instance()
            .db_instance_identifier(format!("{}-ro", instance.name))
            .skip_final_snapshot(true)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versions_leniently() {
        assert_eq!(parse_version("9.6.6"), (9, 6, 6));
        assert_eq!(parse_version("10.4"), (10, 4, 0));
        assert_eq!(parse_version("14"), (14, 0, 0));
        assert_eq!(parse_version("9.6rc1.2"), (9, 6, 2));
        assert_eq!(parse_version(""), (0, 0, 0));
    }

    #[test]
    fn picks_exact_target_when_offered() {
        let targets = vec!["9.6.9".to_string(), "10.4".to_string(), "11.1".to_string()];
        assert_eq!(next_upgrade_step(&targets, "10.4"), Some("10.4".to_string()));
    }

    #[test]
    fn picks_highest_target_otherwise() {
        let targets = vec!["9.6.9".to_string(), "10.4".to_string(), "11.1".to_string()];
        assert_eq!(next_upgrade_step(&targets, "12.2"), Some("11.1".to_string()));
        assert_eq!(next_upgrade_step(&[], "12.2"), None);
    }

    #[test]
    fn rejects_fixed_point() {
        let mut plan = Vec::new();
        let err = push_upgrade_step(&mut plan, "10.4", "10.4".to_string()).unwrap_err();
        assert!(err.to_string().contains("fixed point"));
    }

    #[test]
    fn rejects_duplicate_step() {
        let mut plan = vec!["11.1".to_string()];
        let err = push_upgrade_step(&mut plan, "10.4", "11.1".to_string()).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn caps_plan_length() {
        let mut plan: Vec<String> = (0..MAX_UPGRADE_STEPS).map(|i| format!("{i}.0")).collect();
        let err = push_upgrade_step(&mut plan, "prev", "999.0".to_string()).unwrap_err();
        assert!(err.to_string().contains("exceeded"));
    }

    #[test]
    fn settings_accept_wire_casing_and_ignore_extras() {
        let settings = RdsInstanceSettings::parse(
            r#"{"AllocatedStorage":20,"DBInstanceClass":"db.t3.medium","MultiAZ":true,
                "EngineVersion":"10.4","SomeFutureField":null}"#,
        )
        .unwrap();
        assert_eq!(settings.allocated_storage, Some(20));
        assert_eq!(settings.db_instance_class.as_deref(), Some("db.t3.medium"));
        assert_eq!(settings.multi_az, Some(true));
        assert_eq!(settings.engine_version.as_deref(), Some("10.4"));
    }
}
