//! End-to-end scenarios driven entirely through the command registry, the
//! same entry point the CLI/HTTP/MCP shells use — mirrors `spec.md` §8's
//! concrete scenarios A through E. Scenario F (lease expiration) needs a
//! way to rewind a lease into the past, which only exists as a test-only
//! hook on the concrete in-memory backend, so it lives alongside
//! `services::lease`'s unit tests instead of here.

use std::sync::Arc;

use serde_json::{json, Value};

use questload::command::CommandRegistry;
use questload::storage::memory::InMemoryStorageProvider;
use questload::storage::StorageProvider;
use questload::EngineContext;

async fn new_engine() -> (Arc<EngineContext>, CommandRegistry) {
    let storage: Arc<dyn StorageProvider> = Arc::new(InMemoryStorageProvider::new());
    storage.init().await.unwrap();
    (Arc::new(EngineContext::new(storage)), CommandRegistry::new())
}

fn data(result: &questload::command::CommandResult) -> &Value {
    result.data.as_ref().expect("command should return data")
}

#[tokio::test]
async fn scenario_a_happy_path() {
    let (ctx, registry) = new_engine().await;

    let project = registry
        .dispatch(ctx.clone(), "create_project", json!({ "name": "P1", "maxRetries": 3, "leaseDuration": 10 }))
        .await;
    assert!(project.success, "{:?}", project.error);
    let project_id = data(&project)["id"].as_str().unwrap().to_string();

    let task_type = registry
        .dispatch(
            ctx.clone(),
            "create_task_type",
            json!({ "projectIdOrName": project_id, "name": "T1", "template": "do {{x}}" }),
        )
        .await;
    assert!(task_type.success, "{:?}", task_type.error);

    let task = registry
        .dispatch(
            ctx.clone(),
            "create_task",
            json!({ "projectIdOrName": project_id, "id": "task-1", "variables": { "x": "A" } }),
        )
        .await;
    assert!(task.success, "{:?}", task.error);

    let got = registry.dispatch(ctx.clone(), "get_task", json!({ "taskId": "task-1" })).await;
    assert_eq!(data(&got)["effectiveInstructions"], "do A");

    let next = registry
        .dispatch(ctx.clone(), "get_next_task", json!({ "projectIdOrName": project_id, "workerName": "w1" }))
        .await;
    assert!(next.success, "{:?}", next.error);
    let next_data = data(&next);
    assert_eq!(next_data["task"]["id"], "task-1");
    assert_eq!(next_data["task"]["status"], "running");
    assert_eq!(next_data["agentName"], "w1");

    let complete = registry
        .dispatch(
            ctx.clone(),
            "complete_task",
            json!({ "workerName": "w1", "projectIdOrName": project_id, "taskId": "task-1", "result": "done" }),
        )
        .await;
    assert!(complete.success, "{:?}", complete.error);
    assert_eq!(data(&complete)["status"], "completed");

    let stats = registry
        .dispatch(ctx.clone(), "get_project_stats", json!({ "projectIdOrName": project_id }))
        .await;
    let stats_data = data(&stats);
    assert_eq!(stats_data["total_tasks"], 1);
    assert_eq!(stats_data["completed_tasks"], 1);
}

#[tokio::test]
async fn scenario_b_retry_then_succeed() {
    let (ctx, registry) = new_engine().await;

    let project = registry
        .dispatch(ctx.clone(), "create_project", json!({ "name": "P1" }))
        .await;
    let project_id = data(&project)["id"].as_str().unwrap().to_string();
    registry
        .dispatch(ctx.clone(), "create_task_type", json!({ "projectIdOrName": project_id, "name": "T1" }))
        .await;
    registry
        .dispatch(
            ctx.clone(),
            "create_task",
            json!({ "projectIdOrName": project_id, "id": "task-1", "instructions": "do it" }),
        )
        .await;

    let first = registry
        .dispatch(ctx.clone(), "get_next_task", json!({ "projectIdOrName": project_id, "workerName": "w1" }))
        .await;
    assert_eq!(data(&first)["task"]["id"], "task-1");

    let failed = registry
        .dispatch(
            ctx.clone(),
            "fail_task",
            json!({ "workerName": "w1", "projectIdOrName": project_id, "taskId": "task-1", "error": "oops", "canRetry": true }),
        )
        .await;
    assert!(failed.success, "{:?}", failed.error);
    assert_eq!(data(&failed)["status"], "queued");
    assert_eq!(data(&failed)["retry_count"], 1);

    let second = registry
        .dispatch(ctx.clone(), "get_next_task", json!({ "projectIdOrName": project_id, "workerName": "w2" }))
        .await;
    assert_eq!(data(&second)["task"]["id"], "task-1");

    let complete = registry
        .dispatch(
            ctx.clone(),
            "complete_task",
            json!({ "workerName": "w2", "projectIdOrName": project_id, "taskId": "task-1", "result": "done" }),
        )
        .await;
    assert!(complete.success, "{:?}", complete.error);
    let final_task = data(&complete);
    assert_eq!(final_task["status"], "completed");
    let attempts = final_task["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["status"], "failed");
    assert_eq!(attempts[1]["status"], "completed");
}

/// With `maxRetries=1`, a single `fail(canRetry=true)` already exhausts
/// retries — `retryCount` (now 1) is no longer `< maxRetries` (1) — so the
/// task goes straight to `failed` rather than being requeued once first.
#[tokio::test]
async fn scenario_c_retry_exhaustion() {
    let (ctx, registry) = new_engine().await;

    let project = registry
        .dispatch(ctx.clone(), "create_project", json!({ "name": "P1" }))
        .await;
    let project_id = data(&project)["id"].as_str().unwrap().to_string();
    registry
        .dispatch(
            ctx.clone(),
            "create_task_type",
            json!({ "projectIdOrName": project_id, "name": "T1", "maxRetries": 1 }),
        )
        .await;
    registry
        .dispatch(
            ctx.clone(),
            "create_task",
            json!({ "projectIdOrName": project_id, "id": "task-1", "instructions": "do it" }),
        )
        .await;

    registry
        .dispatch(ctx.clone(), "get_next_task", json!({ "projectIdOrName": project_id, "workerName": "w1" }))
        .await;
    let failed = registry
        .dispatch(
            ctx.clone(),
            "fail_task",
            json!({ "workerName": "w1", "projectIdOrName": project_id, "taskId": "task-1", "error": "e1", "canRetry": true }),
        )
        .await;
    assert!(failed.success, "{:?}", failed.error);
    let task = data(&failed);
    assert_eq!(task["status"], "failed");
    assert_eq!(task["retry_count"], 1);
    assert!(task["failed_at"].is_string());

    let next = registry
        .dispatch(ctx.clone(), "get_next_task", json!({ "projectIdOrName": project_id, "workerName": "w2" }))
        .await;
    assert!(data(&next)["task"].is_null());
}

#[tokio::test]
async fn scenario_d_duplicate_fail_policy() {
    let (ctx, registry) = new_engine().await;

    let project = registry
        .dispatch(ctx.clone(), "create_project", json!({ "name": "P1" }))
        .await;
    let project_id = data(&project)["id"].as_str().unwrap().to_string();
    registry
        .dispatch(
            ctx.clone(),
            "create_task_type",
            json!({ "projectIdOrName": project_id, "name": "T1", "template": "do {{k}}", "duplicateHandling": "fail" }),
        )
        .await;

    let first = registry
        .dispatch(
            ctx.clone(),
            "create_task",
            json!({ "projectIdOrName": project_id, "id": "task-1", "variables": { "k": "v" } }),
        )
        .await;
    assert!(first.success, "{:?}", first.error);

    let duplicate = registry
        .dispatch(
            ctx.clone(),
            "create_task",
            json!({ "projectIdOrName": project_id, "id": "task-2", "variables": { "k": "v" } }),
        )
        .await;
    assert!(!duplicate.success);
    assert!(duplicate.error.unwrap().contains("conflict"));

    // Fail task-1 out, then the same variables should be creatable again.
    registry
        .dispatch(ctx.clone(), "get_next_task", json!({ "projectIdOrName": project_id, "workerName": "w1" }))
        .await;
    let failed = registry
        .dispatch(
            ctx.clone(),
            "fail_task",
            json!({ "workerName": "w1", "projectIdOrName": project_id, "taskId": "task-1", "error": "e", "canRetry": false }),
        )
        .await;
    assert_eq!(data(&failed)["status"], "failed");

    let after_fail = registry
        .dispatch(
            ctx.clone(),
            "create_task",
            json!({ "projectIdOrName": project_id, "id": "task-3", "variables": { "k": "v" } }),
        )
        .await;
    assert!(after_fail.success, "{:?}", after_fail.error);
}

#[tokio::test]
async fn scenario_e_concurrent_assignment_yields_exactly_one_winner() {
    let (ctx, registry) = new_engine().await;
    let registry = Arc::new(registry);

    let project = registry
        .dispatch(ctx.clone(), "create_project", json!({ "name": "P1" }))
        .await;
    let project_id = data(&project)["id"].as_str().unwrap().to_string();
    registry
        .dispatch(ctx.clone(), "create_task_type", json!({ "projectIdOrName": project_id, "name": "T1" }))
        .await;
    registry
        .dispatch(
            ctx.clone(),
            "create_task",
            json!({ "projectIdOrName": project_id, "id": "task-1", "instructions": "do it" }),
        )
        .await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let ctx = ctx.clone();
        let registry = registry.clone();
        let project_id = project_id.clone();
        handles.push(tokio::spawn(async move {
            registry
                .dispatch(
                    ctx,
                    "get_next_task",
                    json!({ "projectIdOrName": project_id, "workerName": format!("w{i}") }),
                )
                .await
        }));
    }

    let mut non_null = 0;
    let mut winning_worker = None;
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success, "{:?}", result.error);
        let task = data(&result)["task"].clone();
        if !task.is_null() {
            non_null += 1;
            assert_eq!(task["id"], "task-1");
            winning_worker = Some(data(&result)["agentName"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(non_null, 1);

    let agents = registry
        .dispatch(ctx.clone(), "list_active_agents", json!({ "projectIdOrName": project_id }))
        .await;
    let agents = data(&agents)["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["name"], winning_worker.unwrap());
}

#[tokio::test]
async fn bulk_create_reports_partial_success_through_the_command_layer() {
    let (ctx, registry) = new_engine().await;

    let project = registry
        .dispatch(ctx.clone(), "create_project", json!({ "name": "P1" }))
        .await;
    let project_id = data(&project)["id"].as_str().unwrap().to_string();
    registry
        .dispatch(ctx.clone(), "create_task_type", json!({ "projectIdOrName": project_id, "name": "T1" }))
        .await;

    let bulk = registry
        .dispatch(
            ctx.clone(),
            "create_tasks_bulk",
            json!({
                "projectIdOrName": project_id,
                "tasks": [
                    { "id": "ok-1", "instructions": "a" },
                    { "id": "ok-1", "instructions": "duplicate id" },
                    { "id": "ok-2", "instructions": "b" },
                ],
            }),
        )
        .await;
    assert!(bulk.success, "{:?}", bulk.error);
    let result = data(&bulk);
    assert_eq!(result["tasks_created"], 2);
    assert_eq!(result["errors"].as_array().unwrap().len(), 1);
}
