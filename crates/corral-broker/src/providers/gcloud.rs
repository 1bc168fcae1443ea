// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed Cloud SQL provider.
//!
//! Drives the sqladmin v1beta4 REST surface directly. Creation is two-phase
//! on this backend: the instance API cannot create the application user, so
//! `provision` returns an instance with an empty endpoint and the
//! `perform-post-provision` task inserts the user once the instance reports
//! RUNNABLE.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use corral_store::models::{BackupSpec, DatabaseUrl, Instance, LogFileSpec, Plan};
use corral_store::status;

use super::roles::{
    create_postgres_readonly_role, delete_postgres_readonly_role, rotate_postgres_readonly_role,
};
use super::{compose_url, random_name, random_password, Provider, ProviderError};

const CACHE_TTL: Duration = Duration::from_secs(30);
const API_BASE: &str = "https://sqladmin.googleapis.com/sql/v1beta4";

/// Wire shape of a Cloud SQL instance resource (the fields the broker reads).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SqlInstance {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    state: String,
    database_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ip_addresses: Vec<SqlIpMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SqlIpMapping {
    #[serde(rename = "type")]
    kind: String,
    ip_address: String,
}

/// "POSTGRES_9_6" style version tags map onto (engine, version).
fn split_database_version(tag: &str) -> (String, String) {
    let mut parts = tag.split('_');
    let engine = parts.next().unwrap_or_default().to_lowercase();
    let version = parts.collect::<Vec<_>>().join(".");
    (engine, version)
}

/// Inverse mapping: a plan's engine/version pair onto the version tag, using
/// at most major.minor.
fn database_version_tag(engine: &str, version: &str) -> String {
    let parts: Vec<&str> = version.split('.').take(2).collect();
    format!("{}_{}", engine.to_uppercase(), parts.join("_"))
}

pub struct GcloudInstanceProvider {
    http: reqwest::Client,
    project_id: String,
    region: String,
    access_token: String,
    name_prefix: String,
    cache: Arc<Mutex<HashMap<String, (std::time::Instant, Instance)>>>,
}

impl GcloudInstanceProvider {
    pub fn new(name_prefix: &str) -> Result<Self, ProviderError> {
        let project_id = std::env::var("GCLOUD_PROJECT_ID").map_err(|_| {
            ProviderError::Config(
                "Unable to find GCLOUD_PROJECT_ID environment variable.".to_string(),
            )
        })?;
        let region = std::env::var("GCLOUD_REGION").map_err(|_| {
            ProviderError::Config("Unable to find GCLOUD_REGION environment variable.".to_string())
        })?;
        let access_token = std::env::var("GCLOUD_ACCESS_TOKEN").map_err(|_| {
            ProviderError::Config(
                "Unable to find GCLOUD_ACCESS_TOKEN environment variable.".to_string(),
            )
        })?;

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
            http: reqwest::Client::new(),
            project_id,
            region,
            access_token,
            name_prefix: name_prefix.to_string(),
            cache,
        })
    }

    fn instances_url(&self, suffix: &str) -> String {
        format!(
            "{API_BASE}/projects/{}/instances{suffix}",
            self.project_id
        )
    }

    async fn api<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let resp = req
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{status}: {body}")));
        }
        Ok(resp.json().await?)
    }

    async fn fetch_instance(&self, name: &str) -> Result<SqlInstance, ProviderError> {
        self.api(self.http.get(self.instances_url(&format!("/{name}"))))
            .await
    }

    fn instance_from(&self, resource: &SqlInstance, name: &str, plan: &Plan) -> Instance {
        let ip_address = resource
            .ip_addresses
            .iter()
            .find(|ip| ip.kind == "PRIMARY")
            .map(|ip| ip.ip_address.clone())
            .unwrap_or_default();
        let endpoint = if ip_address.is_empty() {
            // Not routable yet; the post-provision resync fills this in.
            String::new()
        } else {
            format!("{ip_address}/{}", resource.name)
        };
        let (engine, engine_version) = split_database_version(&resource.database_version);
        Instance {
            id: String::new(),
            name: name.to_string(),
            provider_id: resource.name.clone(),
            plan: plan.clone(),
            username: String::new(),
            password: String::new(),
            endpoint,
            ready: status::is_ready(&resource.state),
            status: resource.state.clone(),
            engine,
            engine_version,
            scheme: plan.scheme.clone(),
        }
    }
}

#[async_trait]
impl Provider for GcloudInstanceProvider {
    async fn get_instance(&self, name: &str, plan: &Plan) -> Result<Instance, ProviderError> {
        let key = format!("{name}{}", plan.id);
        if let Some((at, cached)) = self.cache.lock().await.get(&key) {
            if at.elapsed() < CACHE_TTL {
                return Ok(cached.clone());
            }
        }
        let resource = self.fetch_instance(name).await?;
        if resource.ip_addresses.is_empty() && status::is_ready(&resource.state) {
            return Err(ProviderError::Api(
                "Unable to get instance ip address.".to_string(),
            ));
        }
        let instance = self.instance_from(&resource, name, plan);
        self.cache
            .lock()
            .await
            .insert(key, (std::time::Instant::now(), instance.clone()));
        Ok(instance)
    }

    async fn provision(&self, id: &str, plan: &Plan, owner: &str)
        -> Result<Instance, ProviderError> {
        let mut settings: serde_json::Value =
            serde_json::from_str(plan.provider_private_details())?;
        if !settings.is_object() {
            return Err(ProviderError::Api(
                "plan settings must be a JSON object".to_string(),
            ));
        }
        let billing_code = if owner.is_empty() { "unknown" } else { owner };
        settings["userLabels"]["billing-code"] = json!(billing_code.to_lowercase());

        let name = format!("{}{}", self.name_prefix.to_lowercase(), random_name(8));
        let body = SqlInstance {
            name: name.clone(),
            state: String::new(),
            database_version: database_version_tag(&plan.engine, &plan.engine_version),
            backend_type: Some("SECOND_GEN".to_string()),
            instance_type: Some("CLOUD_SQL_INSTANCE".to_string()),
            project: Some(self.project_id.clone()),
            region: Some(self.region.clone()),
            settings: Some(settings),
            ip_addresses: Vec::new(),
        };
        let _: serde_json::Value = self
            .api(self.http.post(self.instances_url("")).json(&body))
            .await?;

        let resource = self.fetch_instance(&name).await?;
        let mut instance = self.instance_from(&resource, &name, plan);
        instance.id = id.to_string();
        // The user does not exist yet; perform_post_provision creates it with
        // exactly these credentials.
        instance.username = format!("u{}", random_name(8));
        instance.password = random_password(16);
        instance.endpoint = String::new();
        Ok(instance)
    }

    async fn deprovision(
        &self,
        instance: &Instance,
        _take_snapshot: bool,
    ) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .api(
                self.http
                    .delete(self.instances_url(&format!("/{}", instance.name))),
            )
            .await?;
        Ok(())
    }

    async fn modify(&self, instance: &Instance, plan: &Plan) -> Result<Instance, ProviderError> {
        info!(instance = %instance.id, "modifying instance settings");
        let settings: serde_json::Value = serde_json::from_str(plan.provider_private_details())?;

        let mut resource = self.fetch_instance(&instance.name).await?;
        resource.settings = Some(settings);
        let _: serde_json::Value = self
            .api(
                self.http
                    .put(self.instances_url(&format!("/{}", instance.name)))
                    .json(&resource),
            )
            .await?;

        let updated = self.fetch_instance(&instance.name).await?;
        let mut modified = self.instance_from(&updated, &instance.name, plan);
        modified.id = instance.id.clone();
        modified.username = instance.username.clone();
        modified.password = instance.password.clone();
        Ok(modified)
    }

    async fn tag(&self, instance: &Instance, name: &str, value: &str)
        -> Result<(), ProviderError> {
        // Tags are user labels on this backend; merge and patch.
        let patch = json!({
            "settings": { "userLabels": { name.to_lowercase(): value.to_lowercase() } }
        });
        let _: serde_json::Value = self
            .api(
                self.http
                    .patch(self.instances_url(&format!("/{}", instance.name)))
                    .json(&patch),
            )
            .await?;
        Ok(())
    }

    async fn untag(&self, instance: &Instance, name: &str) -> Result<(), ProviderError> {
        let patch = json!({
            "settings": { "userLabels": { name.to_lowercase(): serde_json::Value::Null } }
        });
        let _: serde_json::Value = self
            .api(
                self.http
                    .patch(self.instances_url(&format!("/{}", instance.name)))
                    .json(&patch),
            )
            .await?;
        Ok(())
    }

    async fn get_backup(&self, _: &Instance, _: &str) -> Result<BackupSpec, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn list_backups(&self, _: &Instance) -> Result<Vec<BackupSpec>, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn create_backup(&self, _: &Instance) -> Result<BackupSpec, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn restore_backup(&self, _: &Instance, _: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn restart(&self, instance: &Instance) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .api(
                self.http
                    .post(self.instances_url(&format!("/{}/restart", instance.name))),
            )
            .await?;
        Ok(())
    }

    async fn list_logs(&self, _: &Instance) -> Result<Vec<LogFileSpec>, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn get_logs(&self, _: &Instance, _: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported)
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
        let url = compose_url(
            &instance.scheme,
            &instance.username,
            &instance.password,
            &instance.endpoint,
        );
        create_postgres_readonly_role(instance, &url).await
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
        let url = compose_url(
            &instance.scheme,
            &instance.username,
            &instance.password,
            &instance.endpoint,
        );
        delete_postgres_readonly_role(instance, &url, role).await
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
        let url = compose_url(
            &instance.scheme,
            &instance.username,
            &instance.password,
            &instance.endpoint,
        );
        rotate_postgres_readonly_role(instance, &url, role).await
    }

    async fn create_read_replica(&self, _: &Instance) -> Result<Instance, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn get_read_replica(&self, _: &Instance) -> Result<Instance, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn delete_read_replica(&self, _: &Instance) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported)
    }

    /// Create the application user the instance API could not create at
    /// provision time.
    async fn perform_post_provision(
        &self,
        instance: &Instance,
    ) -> Result<Instance, ProviderError> {
        let user = json!({
            "instance": instance.name,
            "kind": "sql#user",
            "name": instance.username,
            "password": instance.password,
            "project": self.project_id,
        });
        let _: serde_json::Value = self
            .api(
                self.http
                    .post(self.instances_url(&format!("/{}/users", instance.name)))
                    .json(&user),
            )
            .await?;
        Ok(instance.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tags_round_trip() {
        assert_eq!(
            split_database_version("POSTGRES_9_6"),
            ("postgres".to_string(), "9.6".to_string())
        );
        assert_eq!(
            split_database_version("MYSQL_5_7"),
            ("mysql".to_string(), "5.7".to_string())
        );
        assert_eq!(database_version_tag("postgres", "9.6.6"), "POSTGRES_9_6");
        assert_eq!(database_version_tag("mysql", "5.7"), "MYSQL_5_7");
    }

    #[test]
    fn instance_resource_parses_wire_casing() {
        let resource: SqlInstance = serde_json::from_str(
            r#"{"name":"corraldb1","state":"RUNNABLE","databaseVersion":"POSTGRES_9_6",
                "ipAddresses":[{"type":"PRIMARY","ipAddress":"10.0.0.5"},{"type":"OUTGOING","ipAddress":"34.1.2.3"}]}"#,
        )
        .unwrap();
        assert_eq!(resource.state, "RUNNABLE");
        assert_eq!(resource.ip_addresses.len(), 2);
        assert_eq!(
            resource
                .ip_addresses
                .iter()
                .find(|ip| ip.kind == "PRIMARY")
                .unwrap()
                .ip_address,
            "10.0.0.5"
        );
    }
}
