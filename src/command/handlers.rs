//! Command handlers — the complete command surface from `spec.md` §6.
//!
//! Every handler is `async fn(Arc<EngineContext>, Value) -> EngineResult<Value>`
//! taking already-resolved arguments (the `@path`/`@-` indirection and
//! inline-vs-file JSON resolution for `create_tasks_bulk` happen in the CLI
//! shell only, never here — handlers always see a plain JSON array).

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::command::{BoxFuture, CommandHandler, CommandSpec, ParamSpec, ParamType};
use crate::error::{EngineError, EngineResult};
use crate::model::{DuplicateHandling, ProjectStatus, TaskStatus};
use crate::services::task::NewTaskSpec;
use crate::storage::TaskFilter;
use crate::EngineContext;

fn wrap<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Arc<EngineContext>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EngineResult<Value>> + Send + 'static,
{
    Arc::new(move |ctx, args| -> BoxFuture<'static, EngineResult<Value>> { Box::pin(f(ctx, args)) })
}

// ─── Argument extraction helpers ────────────────────────────────────────────

fn str_req(args: &Value, key: &str) -> EngineResult<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| EngineError::validation(key, "required"))
}

fn str_opt(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Distinguishes "field absent" (`None`) from "field explicitly null"
/// (`Some(None)`) for patch-style `Option<Option<String>>` updates.
fn str_patch(args: &Value, key: &str) -> Option<Option<String>> {
    match args.get(key) {
        None => None,
        Some(Value::Null) => Some(None),
        Some(v) => Some(v.as_str().map(|s| s.to_string())),
    }
}

fn i64_opt(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(|v| v.as_i64())
}

fn bool_val(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn i64_val(args: &Value, key: &str, default: i64) -> i64 {
    args.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

/// Accepts either a JSON array already parsed (HTTP/MCP shells) or a JSON
/// string that itself needs parsing (CLI shell passes raw strings through).
fn string_list_opt(args: &Value, key: &str) -> EngineResult<Option<Vec<String>>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(
            items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        )),
        Some(Value::String(s)) => {
            let parsed: Vec<String> = serde_json::from_str(s)
                .map_err(|e| EngineError::validation(key, format!("invalid JSON array: {e}")))?;
            Ok(Some(parsed))
        }
        Some(_) => Err(EngineError::validation(key, "must be an array or JSON array string")),
    }
}

fn variables_opt(args: &Value, key: &str) -> EngineResult<Option<BTreeMap<String, String>>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect(),
        )),
        Some(Value::String(s)) => {
            let parsed: BTreeMap<String, String> = serde_json::from_str(s)
                .map_err(|e| EngineError::validation(key, format!("invalid JSON object: {e}")))?;
            Ok(Some(parsed))
        }
        Some(_) => Err(EngineError::validation(key, "must be an object or JSON object string")),
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn duplicate_handling_opt(args: &Value, key: &str) -> EngineResult<Option<DuplicateHandling>> {
    match str_opt(args, key).as_deref() {
        None => Ok(None),
        Some("allow") => Ok(Some(DuplicateHandling::Allow)),
        Some("ignore") => Ok(Some(DuplicateHandling::Ignore)),
        Some("fail") => Ok(Some(DuplicateHandling::Fail)),
        Some(other) => Err(EngineError::validation(
            key,
            format!("must be one of allow|ignore|fail, got '{other}'"),
        )),
    }
}

fn task_result_from(args: &Value, success: bool) -> EngineResult<crate::model::TaskResult> {
    let output = str_opt(args, "result");
    let error = if success { None } else { str_opt(args, "error") };
    let metadata = match args.get("outputs") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(
            serde_json::from_str(s)
                .map_err(|e| EngineError::validation("outputs", format!("invalid JSON: {e}")))?,
        ),
        Some(v) => Some(v.clone()),
    };
    Ok(crate::model::TaskResult {
        success,
        output,
        error,
        metadata,
        duration_secs: args.get("duration").and_then(|v| v.as_f64()),
    })
}

fn task_status_opt(args: &Value, key: &str) -> EngineResult<Option<TaskStatus>> {
    match str_opt(args, key) {
        None => Ok(None),
        Some(s) => s
            .parse::<TaskStatus>()
            .map(Some)
            .map_err(|_| EngineError::validation(key, format!("unknown status '{s}'"))),
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn create_project(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let name = str_req(&args, "name")?;
    let description = str_opt(&args, "description").unwrap_or_default();
    let instructions = str_opt(&args, "instructions");
    let project = ctx
        .projects
        .create_project(
            &name,
            &description,
            instructions,
            i64_opt(&args, "maxRetries"),
            i64_opt(&args, "leaseDuration"),
            i64_opt(&args, "reaperInterval"),
        )
        .await?;
    Ok(serde_json::to_value(project)?)
}

async fn list_projects(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let status = str_opt(&args, "status").unwrap_or_else(|| "active".to_string());
    let include_closed = bool_val(&args, "includeClosed", false) || status != "active";
    let mut projects = ctx.projects.list_projects(include_closed).await?;
    if status == "closed" {
        projects.retain(|p| p.status == ProjectStatus::Closed);
    }
    let offset = i64_val(&args, "offset", 0).max(0) as usize;
    let limit = i64_val(&args, "limit", 100).max(0) as usize;
    let page: Vec<_> = projects.into_iter().skip(offset).take(limit).collect();
    Ok(json!({ "projects": page }))
}

async fn get_project(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let id = str_req(&args, "projectIdOrName")?;
    let project = ctx.projects.get_project(&id).await?;
    Ok(serde_json::to_value(project)?)
}

async fn update_project(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let id = str_req(&args, "projectIdOrName")?;
    let status = match str_opt(&args, "status").as_deref() {
        None => None,
        Some("active") => Some(ProjectStatus::Active),
        Some("closed") => Some(ProjectStatus::Closed),
        Some(other) => {
            return Err(EngineError::validation(
                "status",
                format!("must be 'active' or 'closed', got '{other}'"),
            ))
        }
    };
    let project = ctx
        .projects
        .update_project(
            &id,
            str_opt(&args, "name"),
            str_opt(&args, "description"),
            str_patch(&args, "instructions"),
            status,
            i64_opt(&args, "maxRetries"),
            i64_opt(&args, "leaseDuration"),
            i64_opt(&args, "reaperInterval"),
        )
        .await?;
    Ok(serde_json::to_value(project)?)
}

async fn get_project_stats(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let id = str_req(&args, "projectIdOrName")?;
    let stats = ctx.projects.get_project_stats(&id).await?;
    Ok(serde_json::to_value(stats)?)
}

async fn create_task_type(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let name = str_req(&args, "name")?;
    let template = str_opt(&args, "template").filter(|t| !t.is_empty());
    let variables = string_list_opt(&args, "variables")?;
    let duplicate_handling = duplicate_handling_opt(&args, "duplicateHandling")?.unwrap_or(DuplicateHandling::Allow);
    let task_type = ctx
        .task_types
        .create_task_type(
            &project,
            &name,
            template,
            variables,
            duplicate_handling,
            i64_opt(&args, "maxRetries"),
            i64_opt(&args, "leaseDuration"),
        )
        .await?;
    Ok(serde_json::to_value(task_type)?)
}

async fn list_task_types(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let types = ctx.task_types.list_task_types(&project).await?;
    Ok(json!({ "taskTypes": types }))
}

async fn get_task_type(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let id = str_req(&args, "typeId")?;
    let task_type = ctx.task_types.get_task_type(&id).await?;
    Ok(serde_json::to_value(task_type)?)
}

async fn update_task_type(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let id = str_req(&args, "typeId")?;
    let task_type = ctx
        .task_types
        .update_task_type(
            &id,
            str_opt(&args, "name"),
            str_patch(&args, "template"),
            string_list_opt(&args, "variables")?,
            duplicate_handling_opt(&args, "duplicateHandling")?,
            i64_opt(&args, "maxRetries"),
            i64_opt(&args, "leaseDuration"),
        )
        .await?;
    Ok(serde_json::to_value(task_type)?)
}

fn task_spec_from(args: &Value) -> EngineResult<NewTaskSpec> {
    Ok(NewTaskSpec {
        type_id_or_name: str_opt(args, "type"),
        id: str_opt(args, "id"),
        description: str_opt(args, "description").unwrap_or_default(),
        instructions: str_opt(args, "instructions"),
        variables: variables_opt(args, "variables")?,
    })
}

async fn create_task(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let spec = task_spec_from(&args)?;
    let task = ctx.tasks.create_task(&project, spec).await?;
    Ok(serde_json::to_value(task)?)
}

async fn create_tasks_bulk(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let entries = args
        .get("tasks")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::validation("tasks", "required array of task specs"))?;
    let mut specs = Vec::with_capacity(entries.len());
    for entry in entries {
        specs.push(task_spec_from(entry)?);
    }
    let result = ctx.tasks.create_tasks_bulk(&project, specs).await?;
    Ok(serde_json::to_value(result)?)
}

async fn list_tasks(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let filter = TaskFilter {
        status: task_status_opt(&args, "status")?,
        type_id: str_opt(&args, "typeId"),
        assigned_to: str_opt(&args, "assignedTo"),
        limit: i64_val(&args, "limit", 50),
        offset: i64_val(&args, "offset", 0),
    };
    let tasks = ctx.tasks.list_tasks(&project, filter).await?;
    Ok(json!({ "tasks": tasks }))
}

async fn get_task(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let id = str_req(&args, "taskId")?;
    let task = ctx.tasks.get_task(&id).await?;
    let effective = ctx.tasks.effective_instructions(&task).await?;
    let mut value = serde_json::to_value(task)?;
    value["effectiveInstructions"] = json!(effective);
    Ok(value)
}

async fn get_next_task(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let worker_name = str_opt(&args, "workerName");
    let outcome = ctx.lease.get_next_task(&project, worker_name).await?;
    Ok(json!({
        "task": outcome.task,
        "agentName": outcome.worker_name,
    }))
}

async fn peek_next_task(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let count = ctx.lease.peek_next_task(&project).await?;
    Ok(json!({ "queuedTasks": count }))
}

async fn list_active_agents(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let agents = ctx.agents.list_active_agents(&project).await?;
    Ok(json!({ "agents": agents }))
}

async fn complete_task(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let worker_name = str_req(&args, "workerName")?;
    let project = str_req(&args, "projectIdOrName")?;
    let task_id = str_req(&args, "taskId")?;
    let result = task_result_from(&args, true)?;
    let task = ctx
        .lease
        .complete_task(&worker_name, &project, &task_id, result)
        .await?;
    Ok(serde_json::to_value(task)?)
}

async fn fail_task(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let worker_name = str_req(&args, "workerName")?;
    let project = str_req(&args, "projectIdOrName")?;
    let task_id = str_req(&args, "taskId")?;
    let result = task_result_from(&args, false)?;
    let can_retry = bool_val(&args, "canRetry", true);
    let task = ctx
        .lease
        .fail_task(&worker_name, &project, &task_id, result, can_retry)
        .await?;
    Ok(serde_json::to_value(task)?)
}

async fn extend_task_lease(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let task_id = str_req(&args, "taskId")?;
    let minutes = i64_opt(&args, "minutes")
        .ok_or_else(|| EngineError::validation("minutes", "required"))?;
    let task = ctx.storage.extend_lease(&task_id, minutes).await?;
    Ok(serde_json::to_value(task)?)
}

async fn get_lease_stats(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let stats = ctx.projects.get_project_stats(&project).await?;
    let queued = ctx.lease.peek_next_task(&project).await?;
    let agents = ctx.agents.list_active_agents(&project).await?;
    Ok(json!({
        "stats": stats,
        "queuedTasks": queued,
        "activeAgents": agents.len(),
    }))
}

async fn cleanup_expired_leases(ctx: Arc<EngineContext>, args: Value) -> EngineResult<Value> {
    let project = str_req(&args, "projectIdOrName")?;
    let summary = ctx.lease.cleanup_expired_leases(&project).await?;
    Ok(serde_json::to_value(summary)?)
}

async fn health_check(ctx: Arc<EngineContext>, _args: Value) -> EngineResult<Value> {
    let health = ctx.storage.health_check().await?;
    let metrics = ctx.storage.get_metrics().await?;
    Ok(json!({
        "healthy": health.healthy,
        "message": health.message,
        "metrics": metrics,
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
    }))
}

// ─── Registry assembly ──────────────────────────────────────────────────────

fn p(name: &'static str, ty: ParamType, desc: &'static str) -> ParamSpec {
    ParamSpec::new(name, ty, desc)
}

pub fn all_commands() -> Vec<CommandSpec> {
    use ParamType::*;
    vec![
        CommandSpec {
            name: "create_project",
            cli_name: "create-project",
            protocol_name: "create_project",
            description: "Create a new project.",
            params: vec![
                p("name", String, "project name, unique across all projects").positional().required(),
                p("description", String, "human-readable description").positional(),
                p("instructions", String, "free text handed to workers"),
                p("maxRetries", Number, "default retries for task types in this project").default(json!(3)),
                p("leaseDuration", Number, "default lease duration in minutes").default(json!(10)),
                p("reaperInterval", Number, "reaper sweep interval in minutes").default(json!(1)),
            ],
            handler: wrap(create_project),
        },
        CommandSpec {
            name: "list_projects",
            cli_name: "list-projects",
            protocol_name: "list_projects",
            description: "List projects.",
            params: vec![
                p("status", String, "active|closed|all").choices(&["active", "closed", "all"]).default(json!("active")),
                p("includeClosed", Boolean, "include closed projects").default(json!(false)),
                p("limit", Number, "max results").default(json!(100)),
                p("offset", Number, "result offset").default(json!(0)),
            ],
            handler: wrap(list_projects),
        },
        CommandSpec {
            name: "get_project",
            cli_name: "get-project",
            protocol_name: "get_project",
            description: "Fetch a project by id or name.",
            params: vec![p("projectIdOrName", String, "project id or name").positional().required()],
            handler: wrap(get_project),
        },
        CommandSpec {
            name: "update_project",
            cli_name: "update-project",
            protocol_name: "update_project",
            description: "Update a project's fields.",
            params: vec![
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("name", String, "new name"),
                p("description", String, "new description"),
                p("instructions", String, "new instructions"),
                p("status", String, "active|closed").choices(&["active", "closed"]),
                p("maxRetries", Number, "new default retries"),
                p("leaseDuration", Number, "new default lease duration in minutes"),
                p("reaperInterval", Number, "new reaper interval in minutes"),
            ],
            handler: wrap(update_project),
        },
        CommandSpec {
            name: "get_project_stats",
            cli_name: "get-project-stats",
            protocol_name: "get_project_stats",
            description: "Fetch a project's derived task-count statistics.",
            params: vec![p("projectIdOrName", String, "project id or name").positional().required()],
            handler: wrap(get_project_stats),
        },
        CommandSpec {
            name: "create_task_type",
            cli_name: "create-task-type",
            protocol_name: "create_task_type",
            description: "Create a task type (template + policy) within a project.",
            params: vec![
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("name", String, "task type name, unique within the project").positional().required(),
                p("template", String, "optional {{var}} template string").default(json!("")),
                p("variables", Array, "explicit placeholder list (must match the template)"),
                p("duplicateHandling", String, "allow|ignore|fail")
                    .choices(&["allow", "ignore", "fail"])
                    .default(json!("allow")),
                p("maxRetries", Number, "overrides the project default"),
                p("leaseDuration", Number, "overrides the project default, in minutes"),
            ],
            handler: wrap(create_task_type),
        },
        CommandSpec {
            name: "list_task_types",
            cli_name: "list-task-types",
            protocol_name: "list_task_types",
            description: "List task types in a project.",
            params: vec![p("projectIdOrName", String, "project id or name").positional().required()],
            handler: wrap(list_task_types),
        },
        CommandSpec {
            name: "get_task_type",
            cli_name: "get-task-type",
            protocol_name: "get_task_type",
            description: "Fetch a task type by id.",
            params: vec![p("typeId", String, "task type id").positional().required()],
            handler: wrap(get_task_type),
        },
        CommandSpec {
            name: "update_task_type",
            cli_name: "update-task-type",
            protocol_name: "update_task_type",
            description: "Update a task type's fields.",
            params: vec![
                p("typeId", String, "task type id").positional().required(),
                p("name", String, "new name"),
                p("template", String, "new template string"),
                p("variables", Array, "new explicit placeholder list"),
                p("duplicateHandling", String, "allow|ignore|fail").choices(&["allow", "ignore", "fail"]),
                p("maxRetries", Number, "new retry bound"),
                p("leaseDuration", Number, "new lease duration in minutes"),
            ],
            handler: wrap(update_task_type),
        },
        CommandSpec {
            name: "create_task",
            cli_name: "create-task",
            protocol_name: "create_task",
            description: "Create a single task.",
            params: vec![
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("type", String, "task type id or name (defaults to the project's first type)").alias("t"),
                p("id", String, "caller-supplied task id (auto-generated if omitted)"),
                p("description", String, "free-text description"),
                p("instructions", String, "free-text instructions (non-template task types)"),
                p("variables", String, "JSON object of template variable bindings"),
            ],
            handler: wrap(create_task),
        },
        CommandSpec {
            name: "create_tasks_bulk",
            cli_name: "create-tasks-bulk",
            protocol_name: "create_tasks_bulk",
            description: "Create up to 1000 tasks in one request; reports per-entry errors.",
            params: vec![
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("tasks", Array, "resolved JSON array of task specs (the CLI shell resolves @path/@- here)")
                    .positional()
                    .required(),
            ],
            handler: wrap(create_tasks_bulk),
        },
        CommandSpec {
            name: "list_tasks",
            cli_name: "list-tasks",
            protocol_name: "list_tasks",
            description: "List tasks in a project, newest first.",
            params: vec![
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("status", String, "queued|running|completed|failed")
                    .choices(&["queued", "running", "completed", "failed"]),
                p("typeId", String, "filter by task type id"),
                p("assignedTo", String, "filter by assigned worker name"),
                p("limit", Number, "max results").default(json!(50)),
                p("offset", Number, "result offset").default(json!(0)),
            ],
            handler: wrap(list_tasks),
        },
        CommandSpec {
            name: "get_task",
            cli_name: "get-task",
            protocol_name: "get_task",
            description: "Fetch a task, including its effective (interpolated) instructions.",
            params: vec![p("taskId", String, "task id").positional().required()],
            handler: wrap(get_task),
        },
        CommandSpec {
            name: "get_next_task",
            cli_name: "get-next-task",
            protocol_name: "get_next_task",
            description: "Pop the next queued task and bind it to a worker lease.",
            params: vec![
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("workerName", String, "worker name (auto-generated if omitted; reconnecting a name resumes its lease)").positional(),
            ],
            handler: wrap(get_next_task),
        },
        CommandSpec {
            name: "peek_next_task",
            cli_name: "peek-next-task",
            protocol_name: "peek_next_task",
            description: "Count queued tasks without assigning any (a hint, not a reservation).",
            params: vec![p("projectIdOrName", String, "project id or name").positional().required()],
            handler: wrap(peek_next_task),
        },
        CommandSpec {
            name: "list_active_agents",
            cli_name: "list-active-agents",
            protocol_name: "list_active_agents",
            description: "List workers currently holding a running lease in a project.",
            params: vec![p("projectIdOrName", String, "project id or name").positional().required()],
            handler: wrap(list_active_agents),
        },
        CommandSpec {
            name: "complete_task",
            cli_name: "complete-task",
            protocol_name: "complete_task",
            description: "Mark a running task completed.",
            params: vec![
                p("workerName", String, "must match the task's assignedTo").positional().required(),
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("taskId", String, "task id").positional().required(),
                p("result", String, "output text").positional().required(),
                p("outputs", String, "JSON metadata object"),
            ],
            handler: wrap(complete_task),
        },
        CommandSpec {
            name: "fail_task",
            cli_name: "fail-task",
            protocol_name: "fail_task",
            description: "Mark a running task failed; requeues for retry unless retries are exhausted or canRetry=false.",
            params: vec![
                p("workerName", String, "must match the task's assignedTo").positional().required(),
                p("projectIdOrName", String, "project id or name").positional().required(),
                p("taskId", String, "task id").positional().required(),
                p("error", String, "error message").positional().required(),
                p("canRetry", Boolean, "allow requeue if retries remain").default(json!(true)),
            ],
            handler: wrap(fail_task),
        },
        CommandSpec {
            name: "extend_task_lease",
            cli_name: "extend-lease",
            protocol_name: "extend_task_lease",
            description: "Extend a running task's lease by N minutes.",
            params: vec![
                p("taskId", String, "task id").positional().required(),
                p("minutes", Number, "minutes to add to the current lease expiry").positional().required(),
            ],
            handler: wrap(extend_task_lease),
        },
        CommandSpec {
            name: "get_lease_stats",
            cli_name: "get-lease-stats",
            protocol_name: "get_lease_stats",
            description: "Queue depth, task-status counts, and active agent count for a project.",
            params: vec![p("projectIdOrName", String, "project id or name").positional().required()],
            handler: wrap(get_lease_stats),
        },
        CommandSpec {
            name: "cleanup_expired_leases",
            cli_name: "cleanup-expired-leases",
            protocol_name: "cleanup_expired_leases",
            description: "Reclaim every task in a project whose lease has expired.",
            params: vec![p("projectIdOrName", String, "project id or name").positional().required()],
            handler: wrap(cleanup_expired_leases),
        },
        CommandSpec {
            name: "health_check",
            cli_name: "health-check",
            protocol_name: "health_check",
            description: "Storage backend health and basic metrics.",
            params: vec![],
            handler: wrap(health_check),
        },
    ]
}
