// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the store.

use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No live registry row exists for the requested instance id.
    ///
    /// The message is part of the broker's contract: callers match on it to
    /// distinguish "never provisioned / already deprovisioned" from failures.
    #[error("Cannot find database instance")]
    InstanceNotFound,

    /// No plan exists with the requested id.
    #[error("Not found")]
    PlanNotFound,

    /// The instance id has been used before (live or tombstoned).
    #[error("The instance id is already in use (even if deleted)")]
    InstanceIdTaken,

    /// A write affected an unexpected number of rows.
    #[error("{0}")]
    Invariant(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration application failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON in a stored column could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;
