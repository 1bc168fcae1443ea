// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.
//!
//! Schema bootstrap is idempotent: already-applied migrations are skipped, and
//! the DDL itself is guarded so it also applies to databases created by
//! earlier releases.

use sqlx::migrate::MigrateError;

/// Migrator with all store migrations embedded.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply all pending migrations. Safe to call on every boot.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
