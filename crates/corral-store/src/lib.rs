// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent store for the Corral database broker.
//!
//! This crate owns the durable side of the broker: the service/plan catalog,
//! the instance registry, replica and role bookkeeping, and the task queue
//! that drives long-running operations. Everything is backed by PostgreSQL
//! through sqlx; the schema is embedded as migrations and applied on connect.

pub mod error;
pub mod interp;
pub mod migrations;
pub mod models;
pub mod status;
pub mod storage;

pub use error::StoreError;
pub use models::{
    BackupSpec, CatalogPlan, CatalogService, DatabaseUrl, DbEntry, Instance, LogFileSpec, Plan,
    ProviderKind, Task, TaskAction,
};
pub use storage::Storage;
