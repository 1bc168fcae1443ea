// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider backends.
//!
//! A [`Provider`] is the uniform capability contract over whatever actually
//! hosts a database: a managed RDS instance or cluster, a managed Cloud SQL
//! instance, or a logical database carved out of a shared master. The plan
//! row's provider tag selects the variant; everything above this module is
//! backend-agnostic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;

use corral_store::models::{BackupSpec, DatabaseUrl, Instance, LogFileSpec, Plan, ProviderKind};

mod aws_cluster;
mod aws_instance;
mod gcloud;
mod mysql_shared;
mod postgres_shared;
mod roles;

pub use aws_cluster::AwsClusteredProvider;
pub use aws_instance::AwsInstanceProvider;
pub use gcloud::GcloudInstanceProvider;
pub use mysql_shared::MysqlSharedProvider;
pub use postgres_shared::PostgresSharedProvider;

/// Provider backend errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The capability is not offered by this backend.
    #[error("This feature is not available on this plan.")]
    Unsupported,

    /// The provider has no resource under the requested name.
    #[error("Not found")]
    NotFound,

    /// The instance is not in a state that allows the operation.
    #[error("{0}")]
    Unavailable(String),

    /// Missing or invalid backend credentials/configuration.
    #[error("{0}")]
    Config(String),

    /// The backend API call failed.
    #[error("Provider API error: {0}")]
    Api(String),

    /// Provider-private plan settings could not be parsed.
    #[error("Cannot unmarshal private details: {0}")]
    Settings(#[from] serde_json::Error),

    /// A SQL operation against a shared master failed.
    #[error("{0}")]
    Sql(String),
}

impl From<sqlx::Error> for ProviderError {
    fn from(err: sqlx::Error) -> Self {
        ProviderError::Sql(err.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Api(err.to_string())
    }
}

/// Uniform capability contract over database backends.
///
/// Contracts shared by all variants:
/// - `provision` returns the one and only copy of the generated plaintext
///   password; providers never persist secrets themselves.
/// - `get_instance` never returns secrets.
/// - `deprovision` with `take_snapshot` produces a `<name>-final` snapshot
///   where the backend supports snapshots.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn get_instance(&self, name: &str, plan: &Plan) -> Result<Instance, ProviderError>;

    async fn provision(&self, id: &str, plan: &Plan, owner: &str)
        -> Result<Instance, ProviderError>;

    async fn deprovision(
        &self,
        instance: &Instance,
        take_snapshot: bool,
    ) -> Result<(), ProviderError>;

    async fn modify(&self, instance: &Instance, plan: &Plan) -> Result<Instance, ProviderError>;

    async fn tag(&self, instance: &Instance, name: &str, value: &str)
        -> Result<(), ProviderError>;

    async fn untag(&self, instance: &Instance, name: &str) -> Result<(), ProviderError>;

    async fn get_backup(&self, instance: &Instance, id: &str) -> Result<BackupSpec, ProviderError>;

    async fn list_backups(&self, instance: &Instance) -> Result<Vec<BackupSpec>, ProviderError>;

    async fn create_backup(&self, instance: &Instance) -> Result<BackupSpec, ProviderError>;

    async fn restore_backup(&self, instance: &Instance, id: &str) -> Result<(), ProviderError>;

    async fn restart(&self, instance: &Instance) -> Result<(), ProviderError>;

    async fn list_logs(&self, instance: &Instance) -> Result<Vec<LogFileSpec>, ProviderError>;

    async fn get_logs(&self, instance: &Instance, path: &str) -> Result<String, ProviderError>;

    async fn create_read_only_user(
        &self,
        instance: &Instance,
    ) -> Result<DatabaseUrl, ProviderError>;

    async fn delete_read_only_user(
        &self,
        instance: &Instance,
        role: &str,
    ) -> Result<(), ProviderError>;

    async fn rotate_password_read_only_user(
        &self,
        instance: &Instance,
        role: &str,
    ) -> Result<DatabaseUrl, ProviderError>;

    async fn create_read_replica(&self, instance: &Instance) -> Result<Instance, ProviderError>;

    async fn get_read_replica(&self, instance: &Instance) -> Result<Instance, ProviderError>;

    async fn delete_read_replica(&self, instance: &Instance) -> Result<(), ProviderError>;

    /// Finish provisioning steps the backend could not perform at creation
    /// time. Most backends have nothing to do here.
    async fn perform_post_provision(&self, instance: &Instance)
        -> Result<Instance, ProviderError> {
        Ok(instance.clone())
    }
}

/// Memoizing provider registry.
///
/// Variants are constructed lazily, once per process, so per-provider cache
/// sweepers exist exactly once.
pub struct ProviderRegistry {
    name_prefix: String,
    providers: Mutex<HashMap<ProviderKind, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// The backend for a plan's provider tag.
    pub async fn provider_for_plan(&self, plan: &Plan) -> Result<Arc<dyn Provider>, ProviderError> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&plan.provider) {
            return Ok(provider.clone());
        }
        let provider: Arc<dyn Provider> = match plan.provider {
            ProviderKind::AwsInstance => {
                Arc::new(AwsInstanceProvider::new(&self.name_prefix).await?)
            }
            ProviderKind::AwsCluster => {
                Arc::new(AwsClusteredProvider::new(&self.name_prefix).await?)
            }
            ProviderKind::GcloudInstance => {
                Arc::new(GcloudInstanceProvider::new(&self.name_prefix)?)
            }
            ProviderKind::PostgresShared => {
                Arc::new(PostgresSharedProvider::new(&self.name_prefix))
            }
            ProviderKind::MysqlShared => Arc::new(MysqlSharedProvider::new(&self.name_prefix)),
            ProviderKind::Unknown => {
                return Err(ProviderError::Config(
                    "Unable to find provider for plan.".to_string(),
                ))
            }
        };
        providers.insert(plan.provider, provider.clone());
        Ok(provider)
    }
}

const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random lowercase alphanumeric string, safe for database and user names.
pub fn random_name(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| NAME_CHARSET[rng.gen_range(0..NAME_CHARSET.len())] as char)
        .collect()
}

/// Random mixed-case alphanumeric password.
pub fn random_password(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

/// Substitute `$1`..`$n` placeholders in a SQL template.
///
/// Used for DDL where server-side bind parameters are not allowed (role and
/// database names). Callers only pass broker-generated identifiers.
pub fn apply_params(statement: &str, args: &[&str]) -> String {
    let mut out = statement.to_string();
    // Replace highest-numbered placeholders first so $1 does not eat $10.
    for (i, arg) in args.iter().enumerate().rev() {
        out = out.replace(&format!("${}", i + 1), arg);
    }
    out
}

/// Compose a credential URL, applying the scheme prefix exactly once.
///
/// An endpoint that already carries the scheme prefix is normalized first.
/// DSN-style plans carry an empty scheme and get no prefix at all.
pub fn compose_url(scheme: &str, username: &str, password: &str, endpoint: &str) -> String {
    if scheme.is_empty() {
        return format!("{username}:{password}@{endpoint}");
    }
    let prefix = format!("{scheme}://");
    let endpoint = endpoint.strip_prefix(&prefix).unwrap_or(endpoint);
    format!("{prefix}{username}:{password}@{endpoint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_names_are_lowercase_alphanumeric() {
        let name = random_name(8);
        assert_eq!(name.len(), 8);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(random_name(8), random_name(8));
    }

    #[test]
    fn apply_params_substitutes_in_order() {
        assert_eq!(
            apply_params("grant $2 to $1", &["alice", "reader"]),
            "grant reader to alice"
        );
        // $10 must not be clobbered by $1.
        let args = [
            "a", "b", "c", "d", "e", "f", "g", "h", "i", "ten",
        ];
        assert_eq!(apply_params("$10 then $1", &args), "ten then a");
    }

    #[test]
    fn compose_url_prefixes_scheme_once() {
        assert_eq!(
            compose_url("postgres", "u", "p", "db.example.com:5432/x"),
            "postgres://u:p@db.example.com:5432/x"
        );
        // Endpoint already carries the scheme: normalize instead of doubling.
        assert_eq!(
            compose_url("postgres", "u", "p", "postgres://db.example.com:5432/x"),
            "postgres://u:p@db.example.com:5432/x"
        );
    }

    #[test]
    fn compose_url_dsn_case_has_no_scheme() {
        assert_eq!(
            compose_url("", "u", "p", "tcp(my.example.com:3306)/x"),
            "u:p@tcp(my.example.com:3306)/x"
        );
    }
}
