// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL for the store.
    pub database_url: String,
    /// Prefix for all provider-generated names, 1 to 8 characters.
    pub name_prefix: String,
    /// Whether a failed webhook delivery is retried instead of failed.
    pub retry_webhooks: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`: PostgreSQL connection string for the store
    /// - `NAME_PREFIX`: prefix for provider-generated names (1-8 characters)
    ///
    /// Optional:
    /// - `RETRY_WEBHOOKS`: if set, webhook non-2xx responses cause a retry
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let name_prefix =
            std::env::var("NAME_PREFIX").map_err(|_| ConfigError::Missing("NAME_PREFIX"))?;
        if name_prefix.is_empty() || name_prefix.len() > 8 {
            return Err(ConfigError::Invalid(
                "NAME_PREFIX",
                "must be between 1 and 8 characters",
            ));
        }
        if !name_prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::Invalid(
                "NAME_PREFIX",
                "must be ascii alphanumeric",
            ));
        }

        let retry_webhooks = std::env::var("RETRY_WEBHOOKS").is_ok();

        Ok(Self {
            database_url,
            name_prefix,
            retry_webhooks,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_prefix_length_is_enforced() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/corral");
        std::env::set_var("NAME_PREFIX", "waytoolongprefix");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("NAME_PREFIX", _))
        ));

        std::env::set_var("NAME_PREFIX", "cr1");
        std::env::remove_var("RETRY_WEBHOOKS");
        let config = Config::from_env().expect("valid config");
        assert_eq!(config.name_prefix, "cr1");
        assert!(!config.retry_webhooks);
    }
}
