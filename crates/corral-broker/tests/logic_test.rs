// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end controller tests against a real PostgreSQL.
//!
//! `TEST_DATABASE_URL` doubles as the broker store and as the shared-postgres
//! master (the seeded hobby plans reference it through `PG_HOBBY_9_URI`), so
//! a provision creates a real logical database on the test server and a
//! deprovision drops it again. Skipped when `TEST_DATABASE_URL` is not set;
//! the connected user needs CREATEDB and CREATEROLE.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{Connection, Executor, PgConnection};

use corral_broker::error::BrokerError;
use corral_broker::osb::{
    BindRequest, DeprovisionRequest, GetBindingRequest, LastOperationRequest, OperationState,
    ProvisionRequest,
};
use corral_broker::{preprovision, BusinessLogic};
use corral_store::{Storage, StoreError};

const HOBBY_V9_PLAN: &str = "50660450-61d3-2c13-a3fd-d379997932fa";

static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

fn unique(prefix: &str) -> String {
    format!(
        "{prefix}{:x}",
        std::time::UNIX_EPOCH.elapsed().unwrap().as_nanos()
    )
}

async fn test_logic() -> (Arc<Storage>, BusinessLogic) {
    let database_url = std::env::var("TEST_DATABASE_URL").unwrap();
    // The seeded hobby plans point their shared master at these variables.
    std::env::set_var("PG_HOBBY_9_URI", &database_url);
    std::env::set_var("PG_HOBBY_10_URI", &database_url);
    let storage = Arc::new(Storage::connect(&database_url).await.expect("connect"));
    let logic = BusinessLogic::new(storage.clone(), "test");
    (storage, logic)
}

#[tokio::test]
async fn provision_bind_unbind_deprovision_shared_postgres() {
    skip_if_no_db!();
    let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let (storage, logic) = test_logic().await;
    let instance_id = unique("inst");

    // The catalog exposes the seeded shared-postgres plan.
    let catalog = logic.get_catalog().await.expect("catalog");
    assert!(!catalog.services.is_empty());
    assert!(catalog
        .services
        .iter()
        .flat_map(|s| &s.plans)
        .any(|p| p.id == HOBBY_V9_PLAN));

    // Missing accepts_incomplete is a contract violation.
    let err = logic
        .provision(&ProvisionRequest {
            instance_id: instance_id.clone(),
            plan_id: HOBBY_V9_PLAN.to_string(),
            accepts_incomplete: false,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.status(), 422);
    assert_eq!(err.error_code(), Some("AsyncRequired"));
    assert_eq!(
        err.to_string(),
        "The query parameter accepts_incomplete=true MUST be included the request."
    );

    // Unknown plan is a 404.
    let err = logic
        .provision(&ProvisionRequest {
            instance_id: unique("missing"),
            plan_id: "does not exist".to_string(),
            accepts_incomplete: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.status(), 404);

    // A shared-postgres provision completes synchronously.
    let response = logic
        .provision(&ProvisionRequest {
            instance_id: instance_id.clone(),
            plan_id: HOBBY_V9_PLAN.to_string(),
            accepts_incomplete: true,
            organization_guid: "test-org".to_string(),
            ..Default::default()
        })
        .await
        .expect("provision");
    assert!(!response.is_async);
    assert!(!response.extension_apis.is_empty());

    let op = logic
        .last_operation(&LastOperationRequest {
            instance_id: instance_id.clone(),
            operation: None,
        })
        .await
        .expect("last operation");
    assert_eq!(op.state, OperationState::Succeeded);

    // Bind and read the binding back; the URLs must agree.
    let bind = logic
        .bind(&BindRequest {
            instance_id: instance_id.clone(),
            binding_id: "foo".to_string(),
            app_guid: Some("123e4567-e89b-12d3-a456-426655440000".to_string()),
        })
        .await
        .expect("bind");
    let db_url = bind.credentials.get("DATABASE_URL").expect("DATABASE_URL");
    assert!(db_url.starts_with("postgres://"), "got {db_url}");

    let binding = logic
        .get_binding(&GetBindingRequest {
            instance_id: instance_id.clone(),
            binding_id: "foo".to_string(),
        })
        .await
        .expect("get binding");
    assert_eq!(binding.credentials.get("DATABASE_URL"), Some(db_url));

    // The credential actually works: create a table as the owner.
    let mut conn = PgConnection::connect(&format!("{db_url}?sslmode=disable"))
        .await
        .expect("connect with issued credentials");
    conn.execute("CREATE TABLE mytable (somefield text)")
        .await
        .expect("create table");
    conn.execute("insert into mytable (somefield) values ('fooo')")
        .await
        .expect("insert");

    // Role lifecycle: create, list, get, rotate, delete.
    let role = logic
        .action_create_role(&instance_id)
        .await
        .expect("create role");
    assert!(role.username.starts_with("rdo1"));
    assert!(!role.password.is_empty());
    assert!(!db_url.contains(&role.username));

    let roles = logic.action_list_roles(&instance_id).await.expect("list roles");
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0].username, role.username);

    let fetched = logic
        .action_get_role(&instance_id, &role.username)
        .await
        .expect("get role");
    assert_eq!(fetched.username, role.username);

    let rotated = logic
        .action_rotate_role(&instance_id, &role.username)
        .await
        .expect("rotate role");
    assert_eq!(rotated.username, role.username);
    assert_ne!(rotated.password, role.password);

    let deleted = logic
        .action_delete_role(&instance_id, &role.username)
        .await
        .expect("delete role");
    assert_eq!(deleted["status"], "OK");

    // The action dispatch table routes by name.
    let dispatched = logic
        .dispatch_action("list_roles", &instance_id, &HashMap::new())
        .await
        .expect("dispatch");
    assert!(dispatched.as_array().map(Vec::is_empty).unwrap_or(false));

    // Unbind and deprovision; afterwards the id is tombstoned forever.
    drop(conn);
    logic
        .unbind(&corral_broker::osb::UnbindRequest {
            instance_id: instance_id.clone(),
            binding_id: "foo".to_string(),
        })
        .await
        .expect("unbind");

    let deprovision = logic
        .deprovision(&DeprovisionRequest {
            instance_id: instance_id.clone(),
        })
        .await
        .expect("deprovision");
    assert!(!deprovision.is_async);

    assert!(matches!(
        storage.get_instance(&instance_id).await,
        Err(StoreError::InstanceNotFound)
    ));

    let err = logic
        .provision(&ProvisionRequest {
            instance_id: instance_id.clone(),
            plan_id: HOBBY_V9_PLAN.to_string(),
            accepts_incomplete: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InstanceInvalid(_)));
}

#[tokio::test]
async fn warm_pool_claim_serves_provision() {
    skip_if_no_db!();
    let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let (storage, logic) = test_logic().await;

    // One top-up pass fills the hobby-v9 pool to its configured depth of 1.
    preprovision::run_preprovision_tasks(&storage, &logic.registry(), Duration::ZERO).await;

    let claimed_id = unique("my-new-test-instance");
    let entry = storage
        .get_unclaimed_instance(HOBBY_V9_PLAN, &claimed_id)
        .await
        .expect("claim warm instance");
    assert_eq!(entry.id, claimed_id);
    assert!(entry.claimed);
    assert_eq!(entry.status, "available");
    assert!(!entry.name.is_empty());

    storage
        .return_claimed_instance(&claimed_id)
        .await
        .expect("return claimed instance");

    // A provision against the plan now claims the returned row instead of
    // cold-creating: the entry name must match the pooled database.
    let provision_id = unique("claimed");
    let response = logic
        .provision(&ProvisionRequest {
            instance_id: provision_id.clone(),
            plan_id: HOBBY_V9_PLAN.to_string(),
            accepts_incomplete: true,
            ..Default::default()
        })
        .await
        .expect("provision from pool");
    assert!(!response.is_async);
    let provisioned = storage.get_instance(&provision_id).await.expect("entry");
    assert_eq!(provisioned.name, entry.name, "expected the pooled database to be claimed");

    // Drop the real database behind the pooled row.
    logic
        .deprovision(&DeprovisionRequest {
            instance_id: provision_id,
        })
        .await
        .expect("deprovision pooled instance");
}
