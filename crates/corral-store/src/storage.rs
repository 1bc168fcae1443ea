// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store operations over PostgreSQL.
//!
//! All broker state lives here: the catalog, the instance registry, replica
//! and role bookkeeping, and the task queue. The two operations other
//! components rely on for cross-flow correctness are transactional:
//! [`Storage::get_unclaimed_instance`] (warm-pool claim) and
//! [`Storage::pop_pending_task`] (linearizable pending → started).

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::interp::expand_env;
use crate::models::{
    CatalogPlan, CatalogService, DatabaseUrl, DbEntry, Instance, Plan, ProviderKind, Task,
    TaskAction,
};

const PLAN_COLUMNS: &str = r#"
    plans.plan::text as id,
    plans.service::text as service_id,
    services.name::text as service_name,
    plans.name::text as name,
    plans.human_name,
    plans.description,
    plans.type::text as engine,
    plans.version as engine_version,
    plans.scheme::text as scheme,
    plans.categories,
    plans.cost_cents::int as cost_cents,
    plans.cost_unit::text as cost_unit,
    plans.attributes::text as attributes,
    plans.installable_inside_private_network,
    plans.installable_outside_private_network,
    plans.supports_multiple_installations,
    plans.supports_sharing,
    plans.preprovision,
    plans.beta,
    plans.provider::text as provider,
    plans.provider_private_details::text as provider_private_details,
    plans.deprecated,
    plans.created,
    plans.updated
"#;

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: String,
    service_id: String,
    service_name: String,
    name: String,
    human_name: String,
    description: String,
    engine: String,
    engine_version: String,
    scheme: String,
    categories: String,
    cost_cents: i32,
    cost_unit: String,
    attributes: String,
    installable_inside_private_network: bool,
    installable_outside_private_network: bool,
    supports_multiple_installations: bool,
    supports_sharing: bool,
    preprovision: i32,
    beta: bool,
    provider: String,
    provider_private_details: String,
    deprecated: bool,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl PlanRow {
    fn into_plan(self) -> Result<Plan> {
        let attributes = serde_json::from_str(&self.attributes)?;
        Ok(Plan {
            id: self.id,
            service_id: self.service_id,
            service_name: self.service_name,
            name: self.name,
            human_name: self.human_name,
            description: self.description,
            engine: self.engine,
            engine_version: self.engine_version,
            scheme: self.scheme,
            categories: self.categories,
            cost_cents: self.cost_cents,
            cost_unit: self.cost_unit,
            attributes,
            installable_inside_private_network: self.installable_inside_private_network,
            installable_outside_private_network: self.installable_outside_private_network,
            supports_multiple_installations: self.supports_multiple_installations,
            supports_sharing: self.supports_sharing,
            preprovision: self.preprovision,
            beta: self.beta,
            deprecated: self.deprecated,
            provider: ProviderKind::from_tag(&self.provider),
            // Late-bound operator secrets are resolved exactly once, here.
            provider_private_details: expand_env(&self.provider_private_details),
            created: self.created,
            updated: self.updated,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: String,
    name: String,
    human_name: String,
    description: String,
    categories: String,
    image: String,
    #[allow(dead_code)]
    beta: bool,
    #[allow(dead_code)]
    deprecated: bool,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    action: String,
    database_id: String,
    status: String,
    retries: i64,
    metadata: String,
    result: String,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let action = TaskAction::from_str(&self.action).ok_or_else(|| {
            StoreError::Invariant(format!("unknown task action '{}' in queue", self.action))
        })?;
        Ok(Task {
            id: self.id,
            action,
            database_id: self.database_id,
            status: self.status,
            retries: self.retries,
            metadata: self.metadata,
            result: self.result,
            started: self.started,
            finished: self.finished,
        })
    }
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    /// Connect and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        crate::migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool. Does not run migrations.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    async fn query_plans(&self, filter: &str, arg: &str) -> Result<Vec<Plan>> {
        let query = format!(
            "select {PLAN_COLUMNS} from plans join services on services.service = plans.service \
             where services.deleted = false and plans.deleted = false {filter}"
        );
        let rows: Vec<PlanRow> = sqlx::query_as(&query).bind(arg).fetch_all(&self.pool).await?;
        rows.into_iter().map(PlanRow::into_plan).collect()
    }

    /// All plans under a service, ordered by name.
    pub async fn get_plans(&self, service_id: &str) -> Result<Vec<Plan>> {
        self.query_plans(
            "and plans.service::text = $1 order by plans.name",
            service_id,
        )
        .await
    }

    /// A single plan by id.
    pub async fn get_plan_by_id(&self, plan_id: &str) -> Result<Plan> {
        let mut plans = self.query_plans("and plans.plan::text = $1", plan_id).await?;
        plans.pop().ok_or(StoreError::PlanNotFound)
    }

    /// The full catalog, shaped for the OSB catalog verb.
    pub async fn get_services(&self) -> Result<Vec<CatalogService>> {
        let rows: Vec<ServiceRow> = sqlx::query_as(
            "select service::text as id, name::text as name, human_name, description, \
             categories::text as categories, image::text as image, beta, deprecated \
             from services where deleted = false",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut services = Vec::with_capacity(rows.len());
        for row in rows {
            let plans = self.get_plans(&row.id).await?;
            services.push(CatalogService {
                id: row.id,
                name: row.name,
                description: row.description,
                bindable: true,
                bindings_retrievable: true,
                plan_updateable: true,
                tags: row.categories.split(',').map(str::to_owned).collect(),
                metadata: serde_json::json!({
                    "name": row.human_name,
                    "image": row.image,
                }),
                plans: plans.iter().map(CatalogPlan::from_plan).collect(),
            });
        }
        Ok(services)
    }

    // ------------------------------------------------------------------
    // Instance registry
    // ------------------------------------------------------------------

    /// Look up a live registry row by instance id.
    pub async fn get_instance(&self, id: &str) -> Result<DbEntry> {
        sqlx::query_as::<_, DbEntry>(
            "select id, name, plan::text as plan_id, claimed, status, username, password, endpoint, \
             (select count(*) from tasks where tasks.database = databases.id \
               and tasks.status = 'started' and tasks.deleted = false) as tasks \
             from databases where id = $1 and deleted = false",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::InstanceNotFound)
    }

    /// Insert a freshly provisioned instance, owned by the caller.
    pub async fn add_instance(&self, instance: &Instance) -> Result<()> {
        sqlx::query(
            "insert into databases (id, name, plan, claimed, status, username, password, endpoint) \
             values ($1, $2, $3::uuid, true, $4, $5, $6, $7)",
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.plan.id)
        .bind(&instance.status)
        .bind(&instance.username)
        .bind(&instance.password)
        .bind(&instance.endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh a registry row from the live instance view.
    pub async fn update_instance(&self, instance: &Instance, plan_id: &str) -> Result<()> {
        sqlx::query(
            "update databases set plan = $1::uuid, endpoint = $2, status = $3, username = $4, \
             password = $5, name = $6 where id = $7",
        )
        .bind(plan_id)
        .bind(&instance.endpoint)
        .bind(&instance.status)
        .bind(&instance.username)
        .bind(&instance.password)
        .bind(&instance.name)
        .bind(&instance.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft-delete an instance and everything that hangs off it, atomically.
    /// Leaves no live child rows pointing at a deleted instance.
    pub async fn delete_instance(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("update roles set deleted = true where database = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("update replicas set deleted = true where database = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("update tasks set deleted = true where database = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("update databases set deleted = true where id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fail if any row, tombstones included, already uses this instance id.
    /// Instance ids are never reusable.
    pub async fn validate_instance_id(&self, id: &str) -> Result<()> {
        let (count,): (i64,) = sqlx::query_as("select count(*) from databases where id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if count != 0 {
            return Err(StoreError::InstanceIdTaken);
        }
        Ok(())
    }

    /// Hard-delete a row. Only used to undo a failed pre-provision attempt.
    pub async fn nuke_instance(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("delete from tasks where database = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("delete from roles where database = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("delete from replicas where database = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("delete from databases where id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Claim one warm-pool row for `new_id`, atomically.
    ///
    /// The chosen row is re-keyed to the caller's id, its tasks, roles and
    /// replicas are reparented, and the old row disappears, all in one
    /// transaction. Concurrent claimers skip each other's candidate rows.
    pub async fn get_unclaimed_instance(&self, plan_id: &str, new_id: &str) -> Result<DbEntry> {
        let mut tx = self.pool.begin().await?;

        let entry: Option<DbEntry> = sqlx::query_as(
            "select id, name, plan::text as plan_id, claimed, status, username, password, endpoint, \
             0::bigint as tasks \
             from databases \
             where claimed = false and status = 'available' and deleted = false \
               and id != $1 and plan = $2::uuid \
             limit 1 \
             for update skip locked",
        )
        .bind(new_id)
        .bind(plan_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut entry) = entry else {
            tx.rollback().await?;
            return Err(StoreError::InstanceNotFound);
        };

        sqlx::query(
            "insert into databases (id, name, plan, claimed, status, username, password, endpoint) \
             values ($1, $2, $3::uuid, true, $4, $5, $6, $7)",
        )
        .bind(new_id)
        .bind(&entry.name)
        .bind(&entry.plan_id)
        .bind(&entry.status)
        .bind(&entry.username)
        .bind(&entry.password)
        .bind(&entry.endpoint)
        .execute(&mut *tx)
        .await?;

        for table in ["tasks", "roles", "replicas"] {
            let query =
                format!("update {table} set database = $2 where database = $1 and deleted = false");
            sqlx::query(&query)
                .bind(&entry.id)
                .bind(new_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("delete from databases where id = $1 and deleted = false and claimed = false")
            .bind(&entry.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        entry.id = new_id.to_string();
        entry.claimed = true;
        Ok(entry)
    }

    /// Put a claimed-but-unusable row back into the pool under a fresh id.
    pub async fn return_claimed_instance(&self, id: &str) -> Result<()> {
        let fresh_id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            "update databases set claimed = false, id = $2 \
             where id = $1 and status = 'available' and deleted = false and claimed = true",
        )
        .bind(id)
        .bind(fresh_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Invariant(format!(
                "invalid count returned after trying to return unclaimed db {id}"
            )));
        }
        Ok(())
    }

    /// Compute each plan's warm-pool deficit and insert that many placeholder
    /// rows with status `provisioning`. Returns the placeholders.
    pub async fn start_provisioning_tasks(&self) -> Result<Vec<DbEntry>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "select \
                plans.plan::text, \
                plans.preprovision - ( \
                    select count(*) from databases \
                    where databases.claimed = false \
                      and databases.status in ('available', 'creating', 'provisioning', 'backing-up', 'starting') \
                      and databases.deleted = false \
                      and databases.plan = plans.plan \
                ) as needed \
             from plans join services on plans.service = services.service \
             where plans.deprecated = false and plans.deleted = false \
               and services.deleted = false and services.deprecated = false",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::new();
        for (plan_id, needed) in rows {
            for _ in 0..needed.max(0) {
                let (id,): (String,) = sqlx::query_as(
                    "insert into databases (id, name, plan, claimed, status, username, password, endpoint) \
                     values (uuid_generate_v4()::varchar(1024), '', $1::uuid, false, 'provisioning', '', '', '') \
                     returning id",
                )
                .bind(&plan_id)
                .fetch_one(&self.pool)
                .await?;
                entries.push(DbEntry {
                    id,
                    name: String::new(),
                    plan_id: plan_id.clone(),
                    claimed: false,
                    status: "provisioning".to_string(),
                    username: String::new(),
                    password: String::new(),
                    endpoint: String::new(),
                    tasks: 0,
                });
            }
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Task queue
    // ------------------------------------------------------------------

    /// Enqueue a task for an instance; returns the task id.
    pub async fn add_task(
        &self,
        database_id: &str,
        action: TaskAction,
        metadata: &str,
    ) -> Result<String> {
        let (id,): (String,) = sqlx::query_as(
            "insert into tasks (task, database, action, metadata) \
             values (uuid_generate_v4(), $1, $2, $3) returning task::text",
        )
        .bind(database_id)
        .bind(action.as_str())
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Partial task update; `None` fields are left untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_task(
        &self,
        id: &str,
        status: Option<&str>,
        retries: Option<i64>,
        metadata: Option<&str>,
        result: Option<&str>,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "update tasks set \
                status = coalesce(($2)::task_status, status), \
                retries = coalesce($3, retries), \
                metadata = coalesce($4, metadata), \
                result = coalesce($5, result), \
                started = coalesce($6, started), \
                finished = coalesce($7, finished) \
             where task = ($1)::uuid",
        )
        .bind(id)
        .bind(status)
        .bind(retries)
        .bind(metadata)
        .bind(result)
        .bind(started)
        .bind(finished)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically flip the oldest-updated pending task to `started` and
    /// return it. At most one worker ever observes a given task here.
    pub async fn pop_pending_task(&self) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "update tasks set status = 'started', started = now() \
             where task in ( \
                select task from tasks \
                where status = 'pending' and deleted = false \
                order by updated asc limit 1 \
                for update skip locked \
             ) \
             returning task::text as id, action, database as database_id, status::text as status, \
                       retries::bigint as retries, metadata, result, started, finished",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Diagnostic: warn when started tasks look stale.
    pub async fn warn_on_unfinished_tasks(&self) {
        let stale: sqlx::Result<(i64,)> = sqlx::query_as(
            "select count(*) from tasks \
             where status = 'started' and deleted = false \
               and started < now() - interval '24 hours'",
        )
        .fetch_one(&self.pool)
        .await;
        match stale {
            Ok((0,)) => {}
            Ok((count,)) => warn!(
                count,
                "started tasks are over 24 hours old and have not finished, they may be stale"
            ),
            Err(err) => warn!(error = %err, "unable to select stale tasks"),
        }
    }

    /// True while a plan or provider change is pending or running.
    pub async fn is_upgrading(&self, database_id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "select count(*) from tasks \
             where (status = 'started' or status = 'pending') \
               and (action = 'change-providers' or action = 'change-plans') \
               and deleted = false and database = $1",
        )
        .bind(database_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// True while a restore is pending or running.
    pub async fn is_restoring(&self, database_id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "select count(*) from tasks \
             where (status = 'started' or status = 'pending') \
               and action = 'restore-database' \
               and deleted = false and database = $1",
        )
        .bind(database_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Replicas
    // ------------------------------------------------------------------

    /// The instance's replica credentials, if one exists.
    pub async fn get_replica(&self, instance: &Instance) -> Result<Option<DatabaseUrl>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "select username, password, endpoint from replicas \
             where database = $1 and deleted = false",
        )
        .bind(&instance.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(username, password, endpoint)| DatabaseUrl {
            username,
            password,
            endpoint,
            plan: instance.plan.id.clone(),
        }))
    }

    pub async fn has_replicas(&self, instance: &Instance) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "select count(*) from replicas where database = $1 and deleted = false",
        )
        .bind(&instance.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Record a freshly created replica under its parent instance.
    pub async fn add_replica(&self, parent_id: &str, replica: &Instance) -> Result<()> {
        sqlx::query(
            "insert into replicas (id, database, name, status, username, password, endpoint) \
             values (uuid_generate_v4()::varchar(1024), $1, $2, $3, $4, $5, $6)",
        )
        .bind(parent_id)
        .bind(&replica.name)
        .bind(&replica.status)
        .bind(&replica.username)
        .bind(&replica.password)
        .bind(&replica.endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the replica row from the live replica view.
    pub async fn update_replica(&self, parent_id: &str, replica: &Instance) -> Result<()> {
        sqlx::query(
            "update replicas set status = $2, username = $3, password = $4, endpoint = $5 \
             where database = $1 and deleted = false",
        )
        .bind(parent_id)
        .bind(&replica.status)
        .bind(&replica.username)
        .bind(&replica.password)
        .bind(&replica.endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_replica(&self, parent_id: &str) -> Result<()> {
        sqlx::query("update replicas set deleted = true where database = $1")
            .bind(parent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    pub async fn list_roles(&self, instance: &Instance) -> Result<Vec<DatabaseUrl>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "select username, password from roles where database = $1 and deleted = false",
        )
        .bind(&instance.id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(username, password)| DatabaseUrl {
                username,
                password,
                endpoint: instance.endpoint.clone(),
                plan: String::new(),
            })
            .collect())
    }

    pub async fn get_role(&self, instance: &Instance, username: &str) -> Result<Option<DatabaseUrl>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "select username, password from roles \
             where database = $1 and username = $2 and deleted = false",
        )
        .bind(&instance.id)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(username, password)| DatabaseUrl {
            username,
            password,
            endpoint: instance.endpoint.clone(),
            plan: String::new(),
        }))
    }

    pub async fn has_role(&self, instance: &Instance, username: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "select count(*) from roles where database = $1 and username = $2 and deleted = false",
        )
        .bind(&instance.id)
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn add_role(
        &self,
        instance: &Instance,
        username: &str,
        password: &str,
    ) -> Result<DatabaseUrl> {
        sqlx::query(
            "insert into roles (database, username, password, read_only) values ($1, $2, $3, true)",
        )
        .bind(&instance.id)
        .bind(username)
        .bind(password)
        .execute(&self.pool)
        .await?;
        Ok(DatabaseUrl {
            username: username.to_string(),
            password: password.to_string(),
            endpoint: instance.endpoint.clone(),
            plan: String::new(),
        })
    }

    pub async fn update_role(
        &self,
        instance: &Instance,
        username: &str,
        password: &str,
    ) -> Result<DatabaseUrl> {
        sqlx::query("update roles set password = $3 where database = $1 and username = $2")
            .bind(&instance.id)
            .bind(username)
            .bind(password)
            .execute(&self.pool)
            .await?;
        Ok(DatabaseUrl {
            username: username.to_string(),
            password: password.to_string(),
            endpoint: instance.endpoint.clone(),
            plan: String::new(),
        })
    }

    pub async fn delete_role(&self, instance: &Instance, username: &str) -> Result<()> {
        sqlx::query("update roles set deleted = true where database = $1 and username = $2")
            .bind(&instance.id)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
