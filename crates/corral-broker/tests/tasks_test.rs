// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task engine integration tests.
//!
//! Driven against the real queue in `TEST_DATABASE_URL`: tasks are enqueued,
//! popped through the store's atomic pending -> started transition, and
//! executed with the production dispatch. Skipped without a database.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use corral_broker::providers::ProviderRegistry;
use corral_broker::tasks::{self, WebhookMetadata, WorkerContext};
use corral_broker::webhook;
use corral_store::models::{Instance, Plan, TaskAction};
use corral_store::Storage;

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

async fn test_context() -> (Arc<Storage>, WorkerContext) {
    let database_url = std::env::var("TEST_DATABASE_URL").unwrap();
    std::env::set_var("PG_HOBBY_9_URI", &database_url);
    std::env::set_var("PG_HOBBY_10_URI", &database_url);
    let storage = Arc::new(Storage::connect(&database_url).await.expect("connect"));

    // Tasks left behind by earlier runs would be popped before ours.
    sqlx::query("update tasks set status = 'failed', deleted = true where status = 'pending'")
        .execute(storage.pool())
        .await
        .expect("clear stale pending tasks");

    let ctx = WorkerContext {
        storage: storage.clone(),
        registry: Arc::new(ProviderRegistry::new("test")),
        retry_webhooks: false,
        http: reqwest::Client::new(),
    };
    (storage, ctx)
}

/// Register a fake available instance on the shared-postgres plan. The
/// shared provider answers `get_instance` from plan settings alone, so the
/// database itself does not need to exist.
async fn seed_instance(storage: &Storage, id: &str) -> Instance {
    let plan: Plan = storage.get_plan_by_id(HOBBY_V9_PLAN).await.expect("plan");
    let instance = Instance {
        id: id.to_string(),
        name: unique("taskdb"),
        provider_id: String::new(),
        plan,
        username: "u1".to_string(),
        password: "pw1".to_string(),
        endpoint: "localhost:5432/taskdb".to_string(),
        status: "available".to_string(),
        ready: true,
        engine: "postgres".to_string(),
        engine_version: "9.6.6".to_string(),
        scheme: "postgres".to_string(),
    };
    storage.add_instance(&instance).await.expect("add instance");
    instance
}

async fn task_row(storage: &Storage, task_id: &str) -> (String, String) {
    sqlx::query_as("select status::text, result from tasks where task = ($1)::uuid")
        .bind(task_id)
        .fetch_one(storage.pool())
        .await
        .expect("task row")
}

/// One-shot HTTP server that captures a single request and answers 200.
async fn capture_one_request(listener: TcpListener) -> (String, String) {
    let (mut socket, _) = listener.accept().await.expect("accept");
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.expect("read");
        raw.extend_from_slice(&buf[..n]);
        if let Some(header_end) = find_header_end(&raw) {
            let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            if raw.len() >= header_end + 4 + content_length {
                let body =
                    String::from_utf8_lossy(&raw[header_end + 4..header_end + 4 + content_length])
                        .to_string();
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await
                    .expect("write response");
                return (headers, body);
            }
        }
        if n == 0 {
            panic!("connection closed before a full request arrived");
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

#[tokio::test]
async fn webhook_task_signs_and_delivers() {
    skip_if_no_db!();
    let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let (storage, ctx) = test_context().await;
    let instance = seed_instance(&storage, &unique("hook")).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let captured = tokio::spawn(capture_one_request(listener));

    let metadata = serde_json::to_string(&WebhookMetadata {
        url,
        secret: "s".to_string(),
    })
    .unwrap();
    let task_id = storage
        .add_task(&instance.id, TaskAction::NotifyCreateServiceWebhook, &metadata)
        .await
        .expect("add task");

    let task = storage
        .pop_pending_task()
        .await
        .expect("pop")
        .expect("pending webhook task");
    assert_eq!(task.id, task_id);
    tasks::process_task(&ctx, task).await;

    let (headers, body) = tokio::time::timeout(Duration::from_secs(5), captured)
        .await
        .expect("webhook request arrived")
        .unwrap();
    assert_eq!(body, webhook::CREATED_BODY);
    let signature = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case(webhook::SIGNATURE_HEADER)
                .then(|| value.trim().to_string())
        })
        .expect("signature header present");
    assert_eq!(signature, webhook::sign(body.as_bytes(), "s"));
    assert!(headers.to_lowercase().contains("content-type: application/json"));

    let (status, _) = task_row(&storage, &task_id).await;
    assert_eq!(status, "finished");

    storage.nuke_instance(&instance.id).await.ok();
}

#[tokio::test]
async fn delete_task_fails_after_retry_cap() {
    skip_if_no_db!();
    let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let (storage, ctx) = test_context().await;
    let instance = seed_instance(&storage, &unique("cap")).await;

    let task_id = storage
        .add_task(&instance.id, TaskAction::Delete, &instance.name)
        .await
        .expect("add task");
    // Simulate ten exhausted attempts.
    storage
        .update_task(&task_id, None, Some(10), None, Some("Failed to deprovision: boom"), None, None)
        .await
        .expect("bump retries");

    let task = storage.pop_pending_task().await.unwrap().expect("task");
    assert_eq!(task.retries, 10);
    tasks::process_task(&ctx, task).await;

    let (status, result) = task_row(&storage, &task_id).await;
    assert_eq!(status, "failed");
    assert!(result.contains("Unable to delete database"), "got: {result}");
    assert!(result.contains("Failed to deprovision: boom"), "got: {result}");

    storage.nuke_instance(&instance.id).await.ok();
}

#[tokio::test]
async fn binding_webhook_task_is_a_recognized_noop() {
    skip_if_no_db!();
    let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let (storage, ctx) = test_context().await;
    let instance = seed_instance(&storage, &unique("noop")).await;

    let task_id = storage
        .add_task(&instance.id, TaskAction::NotifyCreateBindingWebhook, "{}")
        .await
        .expect("add task");
    let task = storage.pop_pending_task().await.unwrap().expect("task");
    tasks::process_task(&ctx, task).await;

    let (status, result) = task_row(&storage, &task_id).await;
    assert_eq!(status, "failed");
    assert_eq!(result, "not implemented");

    storage.nuke_instance(&instance.id).await.ok();
}

#[tokio::test]
async fn resync_until_available_finishes_on_available_instance() {
    skip_if_no_db!();
    let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let (storage, ctx) = test_context().await;
    let instance = seed_instance(&storage, &unique("resync")).await;

    let task_id = storage
        .add_task(&instance.id, TaskAction::ResyncUntilAvailable, "")
        .await
        .expect("add task");
    let task = storage.pop_pending_task().await.unwrap().expect("task");
    tasks::process_task(&ctx, task).await;

    // Shared-postgres instances report available immediately, so one pass
    // refreshes the row and finishes the task.
    let (status, _) = task_row(&storage, &task_id).await;
    assert_eq!(status, "finished");

    storage.nuke_instance(&instance.id).await.ok();
}
