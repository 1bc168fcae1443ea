// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store integration tests.
//!
//! These run against a real PostgreSQL pointed to by `TEST_DATABASE_URL` and
//! are skipped when it is not set. The whole lifecycle is exercised in a
//! single test because the task queue is global: parallel tests would pop
//! each other's tasks.

use corral_store::models::{Instance, Plan};
use corral_store::{Storage, StoreError, TaskAction};

/// Seeded shared-postgres plan with a warm-pool depth of 1.
const HOBBY_V9_PLAN: &str = "50660450-61d3-2c13-a3fd-d379997932fa";

/// The task queue and the warm pool are shared database state, so the tests
/// below must not interleave.
static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn serialize_tests() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid_like())
}

fn uuid_like() -> String {
    // Sub-second uniqueness is plenty for a single test process.
    format!("{:x}", std::time::UNIX_EPOCH.elapsed().unwrap().as_nanos())
}

fn fake_instance(id: &str, plan: &Plan) -> Instance {
    Instance {
        id: id.to_string(),
        name: format!("test{}", &uuid_like()[..8]),
        provider_id: String::new(),
        plan: plan.clone(),
        username: "u1".to_string(),
        password: "pw1".to_string(),
        endpoint: "localhost:5432/testdb".to_string(),
        status: "available".to_string(),
        ready: true,
        engine: "postgres".to_string(),
        engine_version: "9.6.6".to_string(),
        scheme: "postgres".to_string(),
    }
}

#[tokio::test]
async fn storage_lifecycle() {
    skip_if_no_db!();
    let _guard = serialize_tests();
    let storage = Storage::connect(&std::env::var("TEST_DATABASE_URL").unwrap())
        .await
        .expect("connect + migrate");

    // Pending tasks left behind by earlier runs would confuse the queue
    // assertions below.
    sqlx::query("update tasks set status = 'failed', deleted = true where status = 'pending'")
        .execute(storage.pool())
        .await
        .expect("clear stale pending tasks");

    // Catalog comes back with the seeded plan.
    let services = storage.get_services().await.expect("get_services");
    assert!(!services.is_empty());
    let plan = storage
        .get_plan_by_id(HOBBY_V9_PLAN)
        .await
        .expect("seeded plan exists");
    assert_eq!(plan.name, "hobby-v9");
    assert_eq!(plan.preprovision, 1);
    assert!(matches!(
        storage.get_plan_by_id("does-not-exist").await,
        Err(StoreError::PlanNotFound)
    ));

    // --- Instance ids are unique forever -------------------------------
    let id = unique("inst");
    let instance = fake_instance(&id, &plan);
    storage.validate_instance_id(&id).await.expect("id unused");
    storage.add_instance(&instance).await.expect("add");
    assert!(matches!(
        storage.validate_instance_id(&id).await,
        Err(StoreError::InstanceIdTaken)
    ));

    let entry = storage.get_instance(&id).await.expect("get");
    assert_eq!(entry.id, id);
    assert!(entry.claimed);
    assert_eq!(entry.status, "available");

    // --- Task queue: pending -> started is single-consumer -------------
    let task_id = storage
        .add_task(&id, TaskAction::ResyncUntilAvailable, "")
        .await
        .expect("add_task");
    assert!(!storage.is_upgrading(&id).await.unwrap());

    let popped = storage
        .pop_pending_task()
        .await
        .expect("pop")
        .expect("one pending task");
    assert_eq!(popped.id, task_id);
    assert_eq!(popped.action, TaskAction::ResyncUntilAvailable);
    assert_eq!(popped.status, "started");
    assert!(popped.started.is_some());
    assert!(
        storage.pop_pending_task().await.expect("pop").is_none(),
        "a started task must never be handed out twice"
    );

    // Partial update leaves untouched fields alone.
    storage
        .update_task(&task_id, Some("pending"), Some(3), None, Some("retrying"), None, None)
        .await
        .expect("update_task");
    let repopped = storage.pop_pending_task().await.unwrap().unwrap();
    assert_eq!(repopped.id, task_id);
    assert_eq!(repopped.retries, 3);
    assert_eq!(repopped.result, "retrying");
    storage
        .update_task(&task_id, Some("finished"), None, None, Some(""), None, Some(chrono::Utc::now()))
        .await
        .unwrap();

    // Upgrade/restore gates key off non-terminal tasks only.
    let upgrade_task = storage
        .add_task(&id, TaskAction::ChangePlans, "{\"plan\":\"x\"}")
        .await
        .unwrap();
    assert!(storage.is_upgrading(&id).await.unwrap());
    assert!(!storage.is_restoring(&id).await.unwrap());
    storage
        .update_task(&upgrade_task, Some("failed"), None, None, Some("boom"), None, Some(chrono::Utc::now()))
        .await
        .unwrap();
    assert!(!storage.is_upgrading(&id).await.unwrap());

    // --- Roles ----------------------------------------------------------
    let role = storage
        .add_role(&instance, "rdo1abc", "rpw")
        .await
        .expect("add_role");
    assert_eq!(role.endpoint, instance.endpoint);
    assert_eq!(storage.has_role(&instance, "rdo1abc").await.unwrap(), 1);
    let rotated = storage
        .update_role(&instance, "rdo1abc", "rpw2")
        .await
        .unwrap();
    assert_eq!(rotated.username, "rdo1abc");
    assert_eq!(rotated.password, "rpw2");
    let fetched = storage
        .get_role(&instance, "rdo1abc")
        .await
        .unwrap()
        .expect("role exists");
    assert_eq!(fetched.password, "rpw2");
    assert_eq!(storage.list_roles(&instance).await.unwrap().len(), 1);

    // --- Replicas -------------------------------------------------------
    assert_eq!(storage.has_replicas(&instance).await.unwrap(), 0);
    let mut replica = fake_instance(&unique("replica"), &plan);
    replica.name = format!("{}-ro", instance.name);
    storage.add_replica(&id, &replica).await.expect("add_replica");
    assert_eq!(storage.has_replicas(&instance).await.unwrap(), 1);
    let url = storage
        .get_replica(&instance)
        .await
        .unwrap()
        .expect("replica url");
    assert_eq!(url.username, replica.username);

    // --- Cascading soft delete -----------------------------------------
    storage.delete_instance(&id).await.expect("delete");
    assert!(matches!(
        storage.get_instance(&id).await,
        Err(StoreError::InstanceNotFound)
    ));
    // Tombstone still blocks reuse.
    assert!(matches!(
        storage.validate_instance_id(&id).await,
        Err(StoreError::InstanceIdTaken)
    ));
    // No live children survive the cascade.
    assert_eq!(storage.has_replicas(&instance).await.unwrap(), 0);
    assert_eq!(storage.has_role(&instance, "rdo1abc").await.unwrap(), 0);
    assert!(storage.pop_pending_task().await.unwrap().is_none());
}

#[tokio::test]
async fn warm_pool_claim_and_return() {
    skip_if_no_db!();
    let _guard = serialize_tests();
    let storage = Storage::connect(&std::env::var("TEST_DATABASE_URL").unwrap())
        .await
        .expect("connect + migrate");
    let plan = storage.get_plan_by_id(HOBBY_V9_PLAN).await.unwrap();

    // Seed one warm row the way the pre-provisioner would have left it.
    let warm = {
        let mut i = fake_instance(&unique("warm"), &plan);
        i.status = "available".to_string();
        i
    };
    sqlx::query(
        "insert into databases (id, name, plan, claimed, status, username, password, endpoint) \
         values ($1, $2, $3::uuid, false, 'available', $4, $5, $6)",
    )
    .bind(&warm.id)
    .bind(&warm.name)
    .bind(&plan.id)
    .bind(&warm.username)
    .bind(&warm.password)
    .bind(&warm.endpoint)
    .execute(storage.pool())
    .await
    .expect("seed warm row");

    let claimed_id = unique("my-new-test-instance");
    let entry = storage
        .get_unclaimed_instance(HOBBY_V9_PLAN, &claimed_id)
        .await
        .expect("claim");
    assert_eq!(entry.id, claimed_id);
    assert!(entry.claimed);
    assert_eq!(entry.status, "available");

    // The claimed row is visible under the new id, the old id is gone.
    storage.get_instance(&claimed_id).await.expect("claimed row");
    assert!(matches!(
        storage.get_instance(&warm.id).await,
        Err(StoreError::InstanceNotFound)
    ));

    // Return puts it back into the pool under a fresh id.
    storage
        .return_claimed_instance(&claimed_id)
        .await
        .expect("return");
    assert!(matches!(
        storage.get_instance(&claimed_id).await,
        Err(StoreError::InstanceNotFound)
    ));
    // A second return of the same id violates the exactly-one-row contract.
    assert!(matches!(
        storage.return_claimed_instance(&claimed_id).await,
        Err(StoreError::Invariant(_))
    ));

    // Clean up: claim whatever warm row is available again and drop it.
    let cleanup_id = unique("cleanup");
    if let Ok(entry) = storage.get_unclaimed_instance(HOBBY_V9_PLAN, &cleanup_id).await {
        storage.nuke_instance(&entry.id).await.expect("nuke");
    }
}

#[tokio::test]
async fn preprovision_deficit() {
    skip_if_no_db!();
    let _guard = serialize_tests();
    let storage = Storage::connect(&std::env::var("TEST_DATABASE_URL").unwrap())
        .await
        .expect("connect + migrate");

    // hobby-v9 has preprovision = 1; after one pass, at least one live
    // unclaimed row in a counted state exists for it, and a second pass
    // creates nothing new for that plan.
    let entries = storage.start_provisioning_tasks().await.expect("deficit");
    let (live,): (i64,) = sqlx::query_as(
        "select count(*) from databases \
         where plan = $1::uuid and claimed = false and deleted = false \
           and status in ('available', 'creating', 'provisioning', 'backing-up', 'starting')",
    )
    .bind(HOBBY_V9_PLAN)
    .fetch_one(storage.pool())
    .await
    .unwrap();
    assert!(live >= 1, "expected a warm row after the deficit pass");

    let second = storage.start_provisioning_tasks().await.expect("deficit");
    assert!(
        !second.iter().any(|e| e.plan_id == HOBBY_V9_PLAN),
        "deficit already satisfied, no new placeholders expected"
    );

    // Drop the placeholders this test created.
    for entry in entries.iter().filter(|e| e.plan_id == HOBBY_V9_PLAN) {
        storage.nuke_instance(&entry.id).await.ok();
    }
}
