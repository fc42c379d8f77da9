//! Storage Provider (C1) — the contract every backend must satisfy.
//!
//! `spec.md` §4.1 fixes this as an interface, not a medium. Two backends are
//! provided: `sqlite` (the production backend, generalized from the
//! teacher's `sqlx`-backed `Storage`/`TaskStorage` pattern) and `memory`
//! (an in-process `tokio::sync::Mutex`-guarded backend used by tests and
//! suitable for single-process embedded use).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::model::{Project, Task, TaskResult, TaskType};

#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub instructions: Option<Option<String>>,
    pub status: Option<crate::model::ProjectStatus>,
    pub default_max_retries: Option<i64>,
    pub default_lease_duration_minutes: Option<i64>,
    pub reaper_interval_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskTypePatch {
    pub name: Option<String>,
    pub template: Option<Option<String>>,
    pub variables: Option<Vec<String>>,
    pub duplicate_handling: Option<crate::model::DuplicateHandling>,
    pub max_retries: Option<i64>,
    pub lease_duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub description: Option<String>,
    pub instructions: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<crate::model::TaskStatus>,
    pub type_id: Option<String>,
    pub assigned_to: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl TaskFilter {
    pub fn with_defaults() -> Self {
        Self {
            limit: 50,
            offset: 0,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionTtl(pub chrono::Duration);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_name: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a reap sweep (`cleanupExpiredLeases`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReclaimSummary {
    pub reclaimed_tasks: i64,
    pub cleaned_agents: i64,
}

/// The storage contract. Every method that mutates queue/lease state must be
/// atomic with respect to concurrent callers — see `assign_task` in
/// particular, which must be linearizable (`spec.md` §4.1, §5, §8).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn init(&self) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;

    // ─── Projects ───────────────────────────────────────────────────────
    async fn create_project(&self, project: Project) -> EngineResult<Project>;
    async fn get_project(&self, id: &str) -> EngineResult<Option<Project>>;
    async fn get_project_by_name(&self, name: &str) -> EngineResult<Option<Project>>;
    async fn update_project(&self, id: &str, patch: ProjectPatch) -> EngineResult<Project>;
    async fn list_projects(&self, include_closed: bool) -> EngineResult<Vec<Project>>;
    async fn delete_project(&self, id: &str) -> EngineResult<()>;

    // ─── Task types ─────────────────────────────────────────────────────
    async fn create_task_type(&self, task_type: TaskType) -> EngineResult<TaskType>;
    async fn get_task_type(&self, id: &str) -> EngineResult<Option<TaskType>>;
    async fn get_task_type_by_name(
        &self,
        project_id: &str,
        name: &str,
    ) -> EngineResult<Option<TaskType>>;
    async fn update_task_type(
        &self,
        id: &str,
        patch: TaskTypePatch,
    ) -> EngineResult<TaskType>;
    async fn list_task_types(&self, project_id: &str) -> EngineResult<Vec<TaskType>>;
    async fn delete_task_type(&self, id: &str) -> EngineResult<()>;
    /// Count of non-deleted tasks referencing this type (delete guard).
    async fn count_tasks_for_type(&self, type_id: &str) -> EngineResult<i64>;

    // ─── Tasks ──────────────────────────────────────────────────────────
    async fn create_task(&self, task: Task) -> EngineResult<Task>;
    async fn get_task(&self, id: &str) -> EngineResult<Option<Task>>;
    async fn update_task(&self, id: &str, patch: TaskPatch) -> EngineResult<Task>;
    async fn list_tasks(
        &self,
        project_id: &str,
        filter: TaskFilter,
    ) -> EngineResult<Vec<Task>>;
    async fn delete_task(&self, id: &str) -> EngineResult<()>;
    async fn find_duplicate_task(
        &self,
        project_id: &str,
        type_id: &str,
        variables: &std::collections::BTreeMap<String, String>,
    ) -> EngineResult<Option<Task>>;
    async fn get_task_history(&self, id: &str) -> EngineResult<Vec<crate::model::Attempt>>;
    /// Next unused sequential numeric suffix for auto-generated `task-N` ids
    /// within a project.
    async fn next_task_sequence(&self, project_id: &str) -> EngineResult<i64>;

    // ─── Atomic primitives ──────────────────────────────────────────────
    async fn assign_task(
        &self,
        project_id: &str,
        worker_name: &str,
    ) -> EngineResult<Option<Task>>;
    async fn complete_task(&self, task_id: &str, result: TaskResult) -> EngineResult<Task>;
    async fn fail_task(
        &self,
        task_id: &str,
        result: TaskResult,
        can_retry: bool,
    ) -> EngineResult<Task>;
    async fn extend_lease(&self, task_id: &str, minutes: i64) -> EngineResult<Task>;
    async fn requeue_task(&self, task_id: &str) -> EngineResult<Task>;
    async fn find_expired_leases(&self) -> EngineResult<Vec<Task>>;
    async fn find_expired_leases_in_project(
        &self,
        project_id: &str,
    ) -> EngineResult<Vec<Task>>;
    /// Find a running task already owned by `worker_name` in `project_id`
    /// (the reconnection path in `getNextTask`).
    async fn find_running_task_for_worker(
        &self,
        project_id: &str,
        worker_name: &str,
    ) -> EngineResult<Option<Task>>;
    /// Tasks currently running in a project, for the agent-view projection.
    async fn list_running_tasks(&self, project_id: &str) -> EngineResult<Vec<Task>>;

    // ─── Health & metrics ───────────────────────────────────────────────
    async fn health_check(&self) -> EngineResult<HealthStatus>;
    async fn get_metrics(&self) -> EngineResult<std::collections::BTreeMap<String, f64>>;

    // ─── Sessions (HTTP shell only) ─────────────────────────────────────
    async fn create_session(&self, session: Session) -> EngineResult<Session>;
    async fn get_session(&self, id: &str) -> EngineResult<Option<Session>>;
    async fn update_session(&self, id: &str, data: serde_json::Value) -> EngineResult<Session>;
    async fn delete_session(&self, id: &str) -> EngineResult<()>;
    async fn find_sessions_by_agent(&self, agent_name: &str) -> EngineResult<Vec<Session>>;
    async fn cleanup_expired_sessions(&self) -> EngineResult<i64>;
}
