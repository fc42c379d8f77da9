//! In-memory `StorageProvider`, grounded in the teacher's mutex-guarded
//! in-process `SchedulerQueue` (`scheduler::queue`): a single
//! `tokio::sync::Mutex` around all state, held for the duration of each
//! read-modify-write. This is the "lockfile" linearizability strategy from
//! `spec.md` §4.1 reduced to an in-process mutex — single-process only,
//! which is fine for tests and small embedded deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::model::{
    Attempt, AttemptStatus, Project, ProjectStats, Task, TaskResult, TaskStatus, TaskType,
};

use super::{
    HealthStatus, ProjectPatch, Session, StorageProvider, TaskFilter, TaskPatch, TaskTypePatch,
};

#[derive(Default)]
struct State {
    projects: HashMap<String, Project>,
    task_types: HashMap<String, TaskType>,
    tasks: HashMap<String, Task>,
    sessions: HashMap<String, Session>,
    task_sequence: HashMap<String, i64>,
}

impl State {
    fn recompute_stats(&mut self, project_id: &str) {
        let mut stats = ProjectStats::default();
        for task in self.tasks.values().filter(|t| t.project_id == project_id) {
            stats.total_tasks += 1;
            match task.status {
                TaskStatus::Queued => stats.queued_tasks += 1,
                TaskStatus::Running => stats.running_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
            }
        }
        if let Some(project) = self.projects.get_mut(project_id) {
            project.stats = stats;
            project.updated_at = Utc::now();
        }
    }
}

pub struct InMemoryStorageProvider {
    state: Mutex<State>,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for InMemoryStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl InMemoryStorageProvider {
    /// Test-only lease rewind: there is no public API for this by design
    /// (a worker can only move a lease forward via `extendLease`), so
    /// integration tests that need to exercise real expiration reach in
    /// here directly instead of sleeping past a one-minute minimum lease.
    pub async fn test_force_lease_expiry(&self, task_id: &str, expires_at: chrono::DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.lease_expires_at = Some(expires_at);
        }
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorageProvider {
    async fn init(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn create_project(&self, project: Project) -> EngineResult<Project> {
        let mut state = self.state.lock().await;
        if state.projects.values().any(|p| p.name == project.name) {
            return Err(EngineError::conflict(format!(
                "project name '{}' already exists",
                project.name
            )));
        }
        state.projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> EngineResult<Option<Project>> {
        Ok(self.state.lock().await.projects.get(id).cloned())
    }

    async fn get_project_by_name(&self, name: &str) -> EngineResult<Option<Project>> {
        Ok(self
            .state
            .lock()
            .await
            .projects
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn update_project(&self, id: &str, patch: ProjectPatch) -> EngineResult<Project> {
        let mut state = self.state.lock().await;
        if let Some(name) = &patch.name {
            if state
                .projects
                .values()
                .any(|p| p.id != id && &p.name == name)
            {
                return Err(EngineError::conflict(format!(
                    "project name '{name}' already exists"
                )));
            }
        }
        let project = state
            .projects
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("project", id))?;
        if let Some(name) = patch.name {
            project.name = name;
        }
        if let Some(description) = patch.description {
            project.description = description;
        }
        if let Some(instructions) = patch.instructions {
            project.instructions = instructions;
        }
        if let Some(status) = patch.status {
            project.status = status;
        }
        if let Some(v) = patch.default_max_retries {
            project.config.default_max_retries = v;
        }
        if let Some(v) = patch.default_lease_duration_minutes {
            project.config.default_lease_duration_minutes = v;
        }
        if let Some(v) = patch.reaper_interval_minutes {
            project.config.reaper_interval_minutes = v;
        }
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    async fn list_projects(&self, include_closed: bool) -> EngineResult<Vec<Project>> {
        let state = self.state.lock().await;
        let mut projects: Vec<Project> = state
            .projects
            .values()
            .filter(|p| include_closed || p.status == crate::model::ProjectStatus::Active)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn delete_project(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state
            .projects
            .remove(id)
            .ok_or_else(|| EngineError::not_found("project", id))?;
        Ok(())
    }

    async fn create_task_type(&self, task_type: TaskType) -> EngineResult<TaskType> {
        let mut state = self.state.lock().await;
        if state
            .task_types
            .values()
            .any(|t| t.project_id == task_type.project_id && t.name == task_type.name)
        {
            return Err(EngineError::conflict(format!(
                "task type name '{}' already exists in this project",
                task_type.name
            )));
        }
        state
            .task_types
            .insert(task_type.id.clone(), task_type.clone());
        Ok(task_type)
    }

    async fn get_task_type(&self, id: &str) -> EngineResult<Option<TaskType>> {
        Ok(self.state.lock().await.task_types.get(id).cloned())
    }

    async fn get_task_type_by_name(
        &self,
        project_id: &str,
        name: &str,
    ) -> EngineResult<Option<TaskType>> {
        Ok(self
            .state
            .lock()
            .await
            .task_types
            .values()
            .find(|t| t.project_id == project_id && t.name == name)
            .cloned())
    }

    async fn update_task_type(
        &self,
        id: &str,
        patch: TaskTypePatch,
    ) -> EngineResult<TaskType> {
        let mut state = self.state.lock().await;
        if let Some(name) = &patch.name {
            let project_id = state
                .task_types
                .get(id)
                .ok_or_else(|| EngineError::not_found("task_type", id))?
                .project_id
                .clone();
            if state
                .task_types
                .values()
                .any(|t| t.id != id && t.project_id == project_id && &t.name == name)
            {
                return Err(EngineError::conflict(format!(
                    "task type name '{name}' already exists in this project"
                )));
            }
        }
        let task_type = state
            .task_types
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("task_type", id))?;
        if let Some(name) = patch.name {
            task_type.name = name;
        }
        if let Some(template) = patch.template {
            task_type.template = template;
        }
        if let Some(variables) = patch.variables {
            task_type.variables = variables;
        }
        if let Some(dh) = patch.duplicate_handling {
            task_type.duplicate_handling = dh;
        }
        if let Some(v) = patch.max_retries {
            task_type.max_retries = v;
        }
        if let Some(v) = patch.lease_duration_minutes {
            task_type.lease_duration_minutes = v;
        }
        task_type.updated_at = Utc::now();
        Ok(task_type.clone())
    }

    async fn list_task_types(&self, project_id: &str) -> EngineResult<Vec<TaskType>> {
        let state = self.state.lock().await;
        let mut types: Vec<TaskType> = state
            .task_types
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        types.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(types)
    }

    async fn delete_task_type(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state
            .task_types
            .remove(id)
            .ok_or_else(|| EngineError::not_found("task_type", id))?;
        Ok(())
    }

    async fn count_tasks_for_type(&self, type_id: &str) -> EngineResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.type_id == type_id)
            .count() as i64)
    }

    async fn create_task(&self, task: Task) -> EngineResult<Task> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(EngineError::conflict(format!(
                "task id '{}' already exists",
                task.id
            )));
        }
        let project_id = task.project_id.clone();
        state.tasks.insert(task.id.clone(), task.clone());
        state.recompute_stats(&project_id);
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> EngineResult<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(id).cloned())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> EngineResult<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("task", id))?;
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(instructions) = patch.instructions {
            task.instructions = instructions;
        }
        Ok(task.clone())
    }

    async fn list_tasks(
        &self,
        project_id: &str,
        filter: TaskFilter,
    ) -> EngineResult<Vec<Task>> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| {
                filter
                    .type_id
                    .as_ref()
                    .map(|ty| ty == &t.type_id)
                    .unwrap_or(true)
            })
            .filter(|t| {
                filter
                    .assigned_to
                    .as_ref()
                    .map(|a| t.assigned_to.as_deref() == Some(a.as_str()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit <= 0 {
            tasks.len()
        } else {
            filter.limit as usize
        };
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_task(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(id)
            .ok_or_else(|| EngineError::not_found("task", id))?;
        if task.status == TaskStatus::Running {
            return Err(EngineError::state("cannot delete a running task"));
        }
        let project_id = task.project_id.clone();
        state.tasks.remove(id);
        state.recompute_stats(&project_id);
        Ok(())
    }

    async fn find_duplicate_task(
        &self,
        project_id: &str,
        type_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> EngineResult<Option<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .find(|t| {
                t.project_id == project_id
                    && t.type_id == type_id
                    && t.status != TaskStatus::Failed
                    && t.variables.as_ref() == Some(variables)
            })
            .cloned())
    }

    async fn get_task_history(&self, id: &str) -> EngineResult<Vec<Attempt>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .get(id)
            .ok_or_else(|| EngineError::not_found("task", id))?
            .attempts
            .clone())
    }

    async fn next_task_sequence(&self, project_id: &str) -> EngineResult<i64> {
        let mut state = self.state.lock().await;
        let counter = state.task_sequence.entry(project_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn assign_task(
        &self,
        project_id: &str,
        worker_name: &str,
    ) -> EngineResult<Option<Task>> {
        let mut state = self.state.lock().await;
        let candidate_id = state
            .tasks
            .values()
            .filter(|t| t.project_id == project_id && t.status == TaskStatus::Queued)
            .min_by_key(|t| (t.created_at, t.id.clone()))
            .map(|t| t.id.clone());

        let Some(candidate_id) = candidate_id else {
            return Ok(None);
        };

        let type_id = state.tasks.get(&candidate_id).unwrap().type_id.clone();
        let lease_minutes = state
            .task_types
            .get(&type_id)
            .map(|t| t.lease_duration_minutes)
            .unwrap_or(10);

        let task = state.tasks.get_mut(&candidate_id).expect("just located");
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.assigned_to = Some(worker_name.to_string());
        task.assigned_at = Some(now);
        task.lease_expires_at = Some(now + chrono::Duration::minutes(lease_minutes));
        task.attempts.push(Attempt {
            id: crate::model::new_id(),
            agent_name: worker_name.to_string(),
            started_at: now,
            completed_at: None,
            status: AttemptStatus::Running,
            result: None,
            lease_expires_at: task.lease_expires_at.unwrap(),
        });
        let result = task.clone();
        state.recompute_stats(project_id);
        Ok(Some(result))
    }

    async fn complete_task(&self, task_id: &str, result: TaskResult) -> EngineResult<Task> {
        let mut state = self.state.lock().await;
        let project_id;
        {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::not_found("task", task_id))?;
            if task.status != TaskStatus::Running {
                return Err(EngineError::state(format!(
                    "task '{task_id}' is not running"
                )));
            }
            let now = Utc::now();
            if let Some(attempt) = task.attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
                attempt.status = AttemptStatus::Completed;
                attempt.completed_at = Some(now);
                attempt.result = Some(result.clone());
            }
            task.status = TaskStatus::Completed;
            task.assigned_to = None;
            task.assigned_at = None;
            task.lease_expires_at = None;
            task.result = Some(result);
            task.completed_at = Some(now);
            project_id = task.project_id.clone();
        }
        state.recompute_stats(&project_id);
        Ok(state.tasks.get(task_id).unwrap().clone())
    }

    async fn fail_task(
        &self,
        task_id: &str,
        result: TaskResult,
        can_retry: bool,
    ) -> EngineResult<Task> {
        let mut state = self.state.lock().await;
        let project_id;
        {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::not_found("task", task_id))?;
            if task.status != TaskStatus::Running {
                return Err(EngineError::state(format!(
                    "task '{task_id}' is not running"
                )));
            }
            let now = Utc::now();
            if let Some(attempt) = task.attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
                attempt.status = AttemptStatus::Failed;
                attempt.completed_at = Some(now);
                attempt.result = Some(result.clone());
            }
            task.retry_count += 1;
            let will_retry = can_retry && task.retry_count < task.max_retries;
            if will_retry {
                task.status = TaskStatus::Queued;
                task.assigned_to = None;
                task.assigned_at = None;
                task.lease_expires_at = None;
            } else {
                task.status = TaskStatus::Failed;
                task.assigned_to = None;
                task.assigned_at = None;
                task.lease_expires_at = None;
                task.result = Some(result);
                task.failed_at = Some(now);
            }
            project_id = task.project_id.clone();
        }
        state.recompute_stats(&project_id);
        Ok(state.tasks.get(task_id).unwrap().clone())
    }

    async fn extend_lease(&self, task_id: &str, minutes: i64) -> EngineResult<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if task.status != TaskStatus::Running {
            return Err(EngineError::state(format!(
                "task '{task_id}' is not running"
            )));
        }
        let current = task
            .lease_expires_at
            .ok_or_else(|| EngineError::state("running task has no lease"))?;
        let extended = current + chrono::Duration::minutes(minutes);
        task.lease_expires_at = Some(extended);
        if let Some(attempt) = task.attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
            attempt.lease_expires_at = extended;
        }
        Ok(task.clone())
    }

    async fn requeue_task(&self, task_id: &str) -> EngineResult<Task> {
        let mut state = self.state.lock().await;
        let project_id;
        {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::not_found("task", task_id))?;
            if task.status != TaskStatus::Running {
                return Err(EngineError::state(format!(
                    "task '{task_id}' is not running"
                )));
            }
            let now = Utc::now();
            if let Some(attempt) = task.attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
                attempt.status = AttemptStatus::Failed;
                attempt.completed_at = Some(now);
                attempt.result = Some(TaskResult {
                    success: false,
                    output: None,
                    error: Some("lease expired".to_string()),
                    metadata: None,
                    duration_secs: None,
                });
            }
            task.retry_count += 1;
            task.status = TaskStatus::Queued;
            task.assigned_to = None;
            task.assigned_at = None;
            task.lease_expires_at = None;
            project_id = task.project_id.clone();
        }
        state.recompute_stats(&project_id);
        Ok(state.tasks.get(task_id).unwrap().clone())
    }

    async fn find_expired_leases(&self) -> EngineResult<Vec<Task>> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.lease_expires_at.map(|e| e < now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_expired_leases_in_project(
        &self,
        project_id: &str,
    ) -> EngineResult<Vec<Task>> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.project_id == project_id
                    && t.status == TaskStatus::Running
                    && t.lease_expires_at.map(|e| e < now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_running_task_for_worker(
        &self,
        project_id: &str,
        worker_name: &str,
    ) -> EngineResult<Option<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .find(|t| {
                t.project_id == project_id
                    && t.status == TaskStatus::Running
                    && t.assigned_to.as_deref() == Some(worker_name)
            })
            .cloned())
    }

    async fn list_running_tasks(&self, project_id: &str) -> EngineResult<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.project_id == project_id && t.status == TaskStatus::Running)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> EngineResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: "in-memory backend OK".to_string(),
        })
    }

    async fn get_metrics(&self) -> EngineResult<BTreeMap<String, f64>> {
        let state = self.state.lock().await;
        let mut metrics = BTreeMap::new();
        metrics.insert("projects".to_string(), state.projects.len() as f64);
        metrics.insert("task_types".to_string(), state.task_types.len() as f64);
        metrics.insert("tasks".to_string(), state.tasks.len() as f64);
        Ok(metrics)
    }

    async fn create_session(&self, session: Session) -> EngineResult<Session> {
        let mut state = self.state.lock().await;
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> EngineResult<Option<Session>> {
        Ok(self.state.lock().await.sessions.get(id).cloned())
    }

    async fn update_session(&self, id: &str, data: serde_json::Value) -> EngineResult<Session> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("session", id))?;
        session.data = data;
        Ok(session.clone())
    }

    async fn delete_session(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.sessions.remove(id);
        Ok(())
    }

    async fn find_sessions_by_agent(&self, agent_name: &str) -> EngineResult<Vec<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.agent_name.as_deref() == Some(agent_name))
            .cloned()
            .collect())
    }

    async fn cleanup_expired_sessions(&self) -> EngineResult<i64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let before = state.sessions.len();
        state.sessions.retain(|_, s| s.expires_at > now);
        Ok((before - state.sessions.len()) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DuplicateHandling, Project, ProjectConfig, ProjectStatus};

    fn new_project(name: &str) -> Project {
        let now = Utc::now();
        Project {
            id: crate::model::new_id(),
            name: name.to_string(),
            description: String::new(),
            instructions: None,
            status: ProjectStatus::Active,
            config: ProjectConfig::default(),
            created_at: now,
            updated_at: now,
            stats: Default::default(),
        }
    }

    #[tokio::test]
    async fn assign_task_returns_none_on_empty_queue() {
        let storage = InMemoryStorageProvider::new();
        let project = storage.create_project(new_project("p1")).await.unwrap();
        let task = storage.assign_task(&project.id, "w1").await.unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn duplicate_project_name_rejected() {
        let storage = InMemoryStorageProvider::new();
        storage.create_project(new_project("p1")).await.unwrap();
        let err = storage.create_project(new_project("p1")).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[allow(dead_code)]
    fn _unused_handling(_: DuplicateHandling) {}
}
