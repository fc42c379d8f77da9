//! SQLite-backed `StorageProvider` — the production backend.
//!
//! Generalizes the teacher's `storage::Storage` / `tasks::TaskStorage` /
//! `task_engine::TaskEngineStorage` pattern: a WAL-mode `SqlitePool` opened
//! against `{data_dir}/questload.db`, schema created via `include_str!`
//! migrations, every query wrapped in the same `QUERY_TIMEOUT` guard the
//! teacher uses to keep a hung query from blocking the daemon indefinitely.
//!
//! `assign_task` is the one primitive that needs more than a single
//! statement: it selects the oldest queued task and flips it to running
//! inside a `BEGIN IMMEDIATE` transaction, which takes SQLite's write lock
//! up front so no other writer can interleave between the SELECT and the
//! UPDATE — this is how the "document store find-and-modify" strategy from
//! `spec.md` §4.1 is realized on top of SQLite's own serialized-writer
//! guarantee.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};

use crate::error::{EngineError, EngineResult};
use crate::model::{
    Attempt, AttemptStatus, DuplicateHandling, Project, ProjectConfig, ProjectStats,
    ProjectStatus, Task, TaskResult, TaskStatus, TaskType,
};

use super::{
    HealthStatus, ProjectPatch, Session, StorageProvider, TaskFilter, TaskPatch, TaskTypePatch,
};

/// Default timeout for individual SQLite queries. Prevents a hung query from
/// blocking the engine indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> EngineResult<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result.map_err(EngineError::from),
        Err(_) => Err(EngineError::Lock {
            message: format!("query timed out after {}s", QUERY_TIMEOUT.as_secs()),
        }),
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

pub struct SqliteStorageProvider {
    pool: SqlitePool,
}

impl SqliteStorageProvider {
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("questload.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::query(include_str!("migrations/001_init.sql"))
            .execute(&pool)
            .await
            .context("running initial schema migration")?;
        Ok(Self { pool })
    }

    /// In-memory SQLite pool, used by integration tests that want to
    /// exercise the real backend without touching disk.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        sqlx::query(include_str!("migrations/001_init.sql"))
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    async fn fetch_project_row(&self, id: &str) -> Result<Option<ProjectRow>> {
        Ok(
            sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn project_stats(&self, project_id: &str) -> Result<ProjectStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END), 0) AS queued,
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) AS running
             FROM tasks WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ProjectStats {
            total_tasks: row.try_get("total")?,
            completed_tasks: row.try_get("completed")?,
            failed_tasks: row.try_get("failed")?,
            queued_tasks: row.try_get("queued")?,
            running_tasks: row.try_get("running")?,
        })
    }

    async fn load_project(&self, id: &str) -> Result<Option<Project>> {
        let Some(row) = self.fetch_project_row(id).await? else {
            return Ok(None);
        };
        let stats = self.project_stats(id).await?;
        Ok(Some(row.into_project(stats)?))
    }

    async fn load_task_type(&self, id: &str) -> Result<Option<TaskType>> {
        let row = sqlx::query_as::<_, TaskTypeRow>("SELECT * FROM task_types WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskTypeRow::into_task_type).transpose()
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }
}

// ─── Row types ──────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    description: String,
    instructions: Option<String>,
    status: String,
    default_max_retries: i64,
    default_lease_duration_minutes: i64,
    reaper_interval_minutes: i64,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn into_project(self, stats: ProjectStats) -> Result<Project> {
        Ok(Project {
            id: self.id,
            name: self.name,
            description: self.description,
            instructions: self.instructions,
            status: match self.status.as_str() {
                "active" => ProjectStatus::Active,
                "closed" => ProjectStatus::Closed,
                other => return Err(anyhow!("unknown project status '{other}'")),
            },
            config: ProjectConfig {
                default_max_retries: self.default_max_retries,
                default_lease_duration_minutes: self.default_lease_duration_minutes,
                reaper_interval_minutes: self.reaper_interval_minutes,
            },
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            stats,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskTypeRow {
    id: String,
    project_id: String,
    name: String,
    template: Option<String>,
    variables: String,
    duplicate_handling: String,
    max_retries: i64,
    lease_duration_minutes: i64,
    created_at: String,
    updated_at: String,
}

impl TaskTypeRow {
    fn into_task_type(self) -> Result<TaskType> {
        Ok(TaskType {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            template: self.template,
            variables: serde_json::from_str(&self.variables)?,
            duplicate_handling: match self.duplicate_handling.as_str() {
                "allow" => DuplicateHandling::Allow,
                "ignore" => DuplicateHandling::Ignore,
                "fail" => DuplicateHandling::Fail,
                other => return Err(anyhow!("unknown duplicate_handling '{other}'")),
            },
            max_retries: self.max_retries,
            lease_duration_minutes: self.lease_duration_minutes,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project_id: String,
    type_id: String,
    description: String,
    status: String,
    instructions: Option<String>,
    variables: Option<String>,
    assigned_to: Option<String>,
    assigned_at: Option<String>,
    lease_expires_at: Option<String>,
    retry_count: i64,
    max_retries: i64,
    attempts: String,
    result: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    failed_at: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            type_id: self.type_id,
            description: self.description,
            status: TaskStatus::from_str(&self.status)?,
            instructions: self.instructions,
            variables: self
                .variables
                .map(|v| serde_json::from_str::<BTreeMap<String, String>>(&v))
                .transpose()?,
            assigned_to: self.assigned_to,
            assigned_at: parse_ts_opt(self.assigned_at)?,
            lease_expires_at: parse_ts_opt(self.lease_expires_at)?,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            attempts: serde_json::from_str::<Vec<Attempt>>(&self.attempts)?,
            result: self
                .result
                .map(|r| serde_json::from_str::<TaskResult>(&r))
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
            failed_at: parse_ts_opt(self.failed_at)?,
        })
    }
}

// ─── StorageProvider impl ───────────────────────────────────────────────────

#[async_trait]
impl StorageProvider for SqliteStorageProvider {
    async fn init(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn create_project(&self, project: Project) -> EngineResult<Project> {
        with_timeout(async {
            let existing = sqlx::query("SELECT id FROM projects WHERE name = ?")
                .bind(&project.name)
                .fetch_optional(&self.pool)
                .await?;
            if existing.is_some() {
                return Err(anyhow!("__conflict__project name '{}' already exists", project.name));
            }
            sqlx::query(
                "INSERT INTO projects
                 (id, name, description, instructions, status, default_max_retries,
                  default_lease_duration_minutes, reaper_interval_minutes, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&project.id)
            .bind(&project.name)
            .bind(&project.description)
            .bind(&project.instructions)
            .bind(match project.status {
                ProjectStatus::Active => "active",
                ProjectStatus::Closed => "closed",
            })
            .bind(project.config.default_max_retries)
            .bind(project.config.default_lease_duration_minutes)
            .bind(project.config.reaper_interval_minutes)
            .bind(fmt_ts(project.created_at))
            .bind(fmt_ts(project.updated_at))
            .execute(&self.pool)
            .await?;
            Ok(project)
        })
        .await
        .map_err(|e| remap_conflict(e))
    }

    async fn get_project(&self, id: &str) -> EngineResult<Option<Project>> {
        with_timeout(self.load_project(id)).await
    }

    async fn get_project_by_name(&self, name: &str) -> EngineResult<Option<Project>> {
        with_timeout(async {
            let row = sqlx::query("SELECT id FROM projects WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                None => Ok(None),
                Some(row) => {
                    let id: String = row.try_get("id")?;
                    self.load_project(&id).await
                }
            }
        })
        .await
    }

    async fn update_project(&self, id: &str, patch: ProjectPatch) -> EngineResult<Project> {
        with_timeout(async {
            let mut current = self
                .fetch_project_row(id)
                .await?
                .ok_or_else(|| anyhow!("__not_found__project__{id}"))?;
            if let Some(name) = &patch.name {
                let clash = sqlx::query("SELECT id FROM projects WHERE name = ? AND id != ?")
                    .bind(name)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                if clash.is_some() {
                    return Err(anyhow!("__conflict__project name '{name}' already exists"));
                }
                current.name = name.clone();
            }
            if let Some(v) = &patch.description {
                current.description = v.clone();
            }
            if let Some(v) = &patch.instructions {
                current.instructions = v.clone();
            }
            if let Some(v) = &patch.status {
                current.status = match v {
                    ProjectStatus::Active => "active".to_string(),
                    ProjectStatus::Closed => "closed".to_string(),
                };
            }
            if let Some(v) = patch.default_max_retries {
                current.default_max_retries = v;
            }
            if let Some(v) = patch.default_lease_duration_minutes {
                current.default_lease_duration_minutes = v;
            }
            if let Some(v) = patch.reaper_interval_minutes {
                current.reaper_interval_minutes = v;
            }
            let now = fmt_ts(Utc::now());
            sqlx::query(
                "UPDATE projects SET name=?, description=?, instructions=?, status=?,
                 default_max_retries=?, default_lease_duration_minutes=?,
                 reaper_interval_minutes=?, updated_at=? WHERE id=?",
            )
            .bind(&current.name)
            .bind(&current.description)
            .bind(&current.instructions)
            .bind(&current.status)
            .bind(current.default_max_retries)
            .bind(current.default_lease_duration_minutes)
            .bind(current.reaper_interval_minutes)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            self.load_project(id)
                .await?
                .ok_or_else(|| anyhow!("project vanished after update"))
        })
        .await
        .map_err(remap_conflict)
        .map_err(|e| remap_not_found(e, "project"))
    }

    async fn list_projects(&self, include_closed: bool) -> EngineResult<Vec<Project>> {
        with_timeout(async {
            let rows: Vec<ProjectRow> = if include_closed {
                sqlx::query_as("SELECT * FROM projects ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            } else {
                sqlx::query_as(
                    "SELECT * FROM projects WHERE status = 'active' ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            };
            let mut projects = Vec::with_capacity(rows.len());
            for row in rows {
                let stats = self.project_stats(&row.id).await?;
                projects.push(row.into_project(stats)?);
            }
            Ok(projects)
        })
        .await
    }

    async fn delete_project(&self, id: &str) -> EngineResult<()> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM projects WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(anyhow!("__not_found__project__{id}"));
            }
            Ok(())
        })
        .await
        .map_err(|e| remap_not_found(e, "project"))
    }

    async fn create_task_type(&self, task_type: TaskType) -> EngineResult<TaskType> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO task_types
                 (id, project_id, name, template, variables, duplicate_handling,
                  max_retries, lease_duration_minutes, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&task_type.id)
            .bind(&task_type.project_id)
            .bind(&task_type.name)
            .bind(&task_type.template)
            .bind(serde_json::to_string(&task_type.variables)?)
            .bind(match task_type.duplicate_handling {
                DuplicateHandling::Allow => "allow",
                DuplicateHandling::Ignore => "ignore",
                DuplicateHandling::Fail => "fail",
            })
            .bind(task_type.max_retries)
            .bind(task_type.lease_duration_minutes)
            .bind(fmt_ts(task_type.created_at))
            .bind(fmt_ts(task_type.updated_at))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    anyhow!(
                        "__conflict__task type name '{}' already exists in this project",
                        task_type.name
                    )
                } else {
                    anyhow::Error::from(e)
                }
            })?;
            Ok(task_type)
        })
        .await
        .map_err(remap_conflict)
    }

    async fn get_task_type(&self, id: &str) -> EngineResult<Option<TaskType>> {
        with_timeout(self.load_task_type(id)).await
    }

    async fn get_task_type_by_name(
        &self,
        project_id: &str,
        name: &str,
    ) -> EngineResult<Option<TaskType>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, TaskTypeRow>(
                "SELECT * FROM task_types WHERE project_id = ? AND name = ?",
            )
            .bind(project_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
            row.map(TaskTypeRow::into_task_type).transpose()
        })
        .await
    }

    async fn update_task_type(&self, id: &str, patch: TaskTypePatch) -> EngineResult<TaskType> {
        with_timeout(async {
            let current = self
                .load_task_type(id)
                .await?
                .ok_or_else(|| anyhow!("__not_found__task_type__{id}"))?;
            let name = patch.name.unwrap_or(current.name);
            let template = patch.template.unwrap_or(current.template);
            let variables = patch.variables.unwrap_or(current.variables);
            let duplicate_handling = patch.duplicate_handling.unwrap_or(current.duplicate_handling);
            let max_retries = patch.max_retries.unwrap_or(current.max_retries);
            let lease_duration_minutes =
                patch.lease_duration_minutes.unwrap_or(current.lease_duration_minutes);
            let now = fmt_ts(Utc::now());
            sqlx::query(
                "UPDATE task_types SET name=?, template=?, variables=?, duplicate_handling=?,
                 max_retries=?, lease_duration_minutes=?, updated_at=? WHERE id=?",
            )
            .bind(&name)
            .bind(&template)
            .bind(serde_json::to_string(&variables)?)
            .bind(match duplicate_handling {
                DuplicateHandling::Allow => "allow",
                DuplicateHandling::Ignore => "ignore",
                DuplicateHandling::Fail => "fail",
            })
            .bind(max_retries)
            .bind(lease_duration_minutes)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    anyhow!("__conflict__task type name '{name}' already exists in this project")
                } else {
                    anyhow::Error::from(e)
                }
            })?;
            self.load_task_type(id)
                .await?
                .ok_or_else(|| anyhow!("task type vanished after update"))
        })
        .await
        .map_err(remap_conflict)
        .map_err(|e| remap_not_found(e, "task_type"))
    }

    async fn list_task_types(&self, project_id: &str) -> EngineResult<Vec<TaskType>> {
        with_timeout(async {
            let rows: Vec<TaskTypeRow> = sqlx::query_as(
                "SELECT * FROM task_types WHERE project_id = ? ORDER BY created_at DESC",
            )
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(TaskTypeRow::into_task_type).collect()
        })
        .await
    }

    async fn delete_task_type(&self, id: &str) -> EngineResult<()> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM task_types WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(anyhow!("__not_found__task_type__{id}"));
            }
            Ok(())
        })
        .await
        .map_err(|e| remap_not_found(e, "task_type"))
    }

    async fn count_tasks_for_type(&self, type_id: &str) -> EngineResult<i64> {
        with_timeout(async {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM tasks WHERE type_id = ?")
                .bind(type_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(row.try_get("n")?)
        })
        .await
    }

    async fn create_task(&self, task: Task) -> EngineResult<Task> {
        with_timeout(async {
            let variables_json = task
                .variables
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let attempts_json = serde_json::to_string(&task.attempts)?;
            let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                "INSERT INTO tasks
                 (id, project_id, type_id, description, status, instructions, variables,
                  assigned_to, assigned_at, lease_expires_at, retry_count, max_retries,
                  attempts, result, created_at, completed_at, failed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&task.id)
            .bind(&task.project_id)
            .bind(&task.type_id)
            .bind(&task.description)
            .bind(task.status.as_str())
            .bind(&task.instructions)
            .bind(&variables_json)
            .bind(&task.assigned_to)
            .bind(task.assigned_at.map(fmt_ts))
            .bind(task.lease_expires_at.map(fmt_ts))
            .bind(task.retry_count)
            .bind(task.max_retries)
            .bind(&attempts_json)
            .bind(&result_json)
            .bind(fmt_ts(task.created_at))
            .bind(task.completed_at.map(fmt_ts))
            .bind(task.failed_at.map(fmt_ts))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") || e.to_string().contains("PRIMARY") {
                    anyhow!("__conflict__task id '{}' already exists", task.id)
                } else {
                    anyhow::Error::from(e)
                }
            })?;
            Ok(task)
        })
        .await
        .map_err(remap_conflict)
    }

    async fn get_task(&self, id: &str) -> EngineResult<Option<Task>> {
        with_timeout(self.load_task(id)).await
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> EngineResult<Task> {
        with_timeout(async {
            let current = self
                .load_task(id)
                .await?
                .ok_or_else(|| anyhow!("__not_found__task__{id}"))?;
            let description = patch.description.unwrap_or(current.description);
            let instructions = patch.instructions.unwrap_or(current.instructions);
            sqlx::query("UPDATE tasks SET description = ?, instructions = ? WHERE id = ?")
                .bind(&description)
                .bind(&instructions)
                .bind(id)
                .execute(&self.pool)
                .await?;
            self.load_task(id)
                .await?
                .ok_or_else(|| anyhow!("task vanished after update"))
        })
        .await
        .map_err(|e| remap_not_found(e, "task"))
    }

    async fn list_tasks(&self, project_id: &str, filter: TaskFilter) -> EngineResult<Vec<Task>> {
        with_timeout(async {
            let mut sql = String::from("SELECT * FROM tasks WHERE project_id = ?");
            if filter.status.is_some() {
                sql.push_str(" AND status = ?");
            }
            if filter.type_id.is_some() {
                sql.push_str(" AND type_id = ?");
            }
            if filter.assigned_to.is_some() {
                sql.push_str(" AND assigned_to = ?");
            }
            sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

            let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(project_id);
            if let Some(status) = filter.status {
                query = query.bind(status.as_str().to_string());
            }
            if let Some(type_id) = &filter.type_id {
                query = query.bind(type_id.clone());
            }
            if let Some(assigned_to) = &filter.assigned_to {
                query = query.bind(assigned_to.clone());
            }
            // SQLite treats a negative LIMIT as "unbounded"; `peek_next_task`
            // relies on this to count the full queue depth.
            let limit = if filter.limit == 0 { 50 } else { filter.limit };
            query = query.bind(limit).bind(filter.offset.max(0));

            let rows: Vec<TaskRow> = query.fetch_all(&self.pool).await?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn delete_task(&self, id: &str) -> EngineResult<()> {
        with_timeout(async {
            let current = self
                .load_task(id)
                .await?
                .ok_or_else(|| anyhow!("__not_found__task__{id}"))?;
            if current.status == TaskStatus::Running {
                return Err(anyhow!("__state__cannot delete a running task"));
            }
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
        .map_err(|e| remap_not_found(e, "task"))
        .map_err(remap_state)
    }

    async fn find_duplicate_task(
        &self,
        project_id: &str,
        type_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> EngineResult<Option<Task>> {
        with_timeout(async {
            let variables_json = serde_json::to_string(variables)?;
            let rows: Vec<TaskRow> = sqlx::query_as(
                "SELECT * FROM tasks WHERE project_id = ? AND type_id = ? AND status != 'failed'
                 AND variables = ?",
            )
            .bind(project_id)
            .bind(type_id)
            .bind(&variables_json)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .next()
                .map(TaskRow::into_task)
                .transpose()
        })
        .await
    }

    async fn get_task_history(&self, id: &str) -> EngineResult<Vec<Attempt>> {
        let task = self
            .load_task(id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::not_found("task", id))?;
        Ok(task.attempts)
    }

    async fn next_task_sequence(&self, project_id: &str) -> EngineResult<i64> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "INSERT INTO task_sequences (project_id, next_value) VALUES (?, 1)
                 ON CONFLICT(project_id) DO NOTHING",
            )
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
            let row = sqlx::query("SELECT next_value FROM task_sequences WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&mut *tx)
                .await?;
            let current: i64 = row.try_get("next_value")?;
            sqlx::query("UPDATE task_sequences SET next_value = ? WHERE project_id = ?")
                .bind(current + 1)
                .bind(project_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(current)
        })
        .await
    }

    async fn assign_task(&self, project_id: &str, worker_name: &str) -> EngineResult<Option<Task>> {
        with_timeout(async {
            // BEGIN IMMEDIATE grabs SQLite's single write lock up front, so
            // the candidate SELECT below and the UPDATE that claims it run
            // as one atomic step with respect to every other connection on
            // this pool — nobody else can claim the same row in between.
            let mut conn = self.pool.acquire().await?;
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

            let outcome: Result<Option<String>> = async {
                let candidate = sqlx::query(
                    "SELECT id FROM tasks WHERE project_id = ? AND status = 'queued'
                     ORDER BY created_at ASC, rowid ASC LIMIT 1",
                )
                .bind(project_id)
                .fetch_optional(&mut *conn)
                .await?;

                let Some(candidate) = candidate else {
                    return Ok(None);
                };
                let task_id: String = candidate.try_get("id")?;

                let lease_row = sqlx::query(
                    "SELECT t.lease_duration_minutes AS minutes FROM task_types t
                     JOIN tasks k ON k.type_id = t.id WHERE k.id = ?",
                )
                .bind(&task_id)
                .fetch_one(&mut *conn)
                .await?;
                let lease_minutes: i64 = lease_row.try_get("minutes")?;

                let now = Utc::now();
                let lease_expires_at = now + chrono::Duration::minutes(lease_minutes);

                let affected = sqlx::query(
                    "UPDATE tasks SET status = 'running', assigned_to = ?, assigned_at = ?,
                     lease_expires_at = ? WHERE id = ? AND status = 'queued'",
                )
                .bind(worker_name)
                .bind(fmt_ts(now))
                .bind(fmt_ts(lease_expires_at))
                .bind(&task_id)
                .execute(&mut *conn)
                .await?
                .rows_affected();

                if affected == 0 {
                    return Ok(None);
                }

                let attempts_row = sqlx::query("SELECT attempts FROM tasks WHERE id = ?")
                    .bind(&task_id)
                    .fetch_one(&mut *conn)
                    .await?;
                let attempts_json: String = attempts_row.try_get("attempts")?;
                let mut attempts: Vec<Attempt> = serde_json::from_str(&attempts_json)?;
                attempts.push(Attempt {
                    id: crate::model::new_id(),
                    agent_name: worker_name.to_string(),
                    started_at: now,
                    completed_at: None,
                    status: AttemptStatus::Running,
                    result: None,
                    lease_expires_at,
                });
                sqlx::query("UPDATE tasks SET attempts = ? WHERE id = ?")
                    .bind(serde_json::to_string(&attempts)?)
                    .bind(&task_id)
                    .execute(&mut *conn)
                    .await?;

                Ok(Some(task_id))
            }
            .await;

            match outcome {
                Ok(Some(task_id)) => {
                    sqlx::query("COMMIT").execute(&mut *conn).await?;
                    self.load_task(&task_id).await
                }
                Ok(None) => {
                    sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
                    Ok(None)
                }
                Err(e) => {
                    sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
                    Err(e)
                }
            }
        })
        .await
    }

    async fn complete_task(&self, task_id: &str, result: TaskResult) -> EngineResult<Task> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;
            let current = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| anyhow!("__not_found__task__{task_id}"))?;
            if current.status != "running" {
                return Err(anyhow!("__state__task '{task_id}' is not running"));
            }
            let now = Utc::now();
            let mut attempts: Vec<Attempt> = serde_json::from_str(&current.attempts)?;
            if let Some(attempt) = attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
                attempt.status = AttemptStatus::Completed;
                attempt.completed_at = Some(now);
                attempt.result = Some(result.clone());
            }
            sqlx::query(
                "UPDATE tasks SET status = 'completed', assigned_to = NULL, assigned_at = NULL,
                 lease_expires_at = NULL, result = ?, completed_at = ?, attempts = ? WHERE id = ?",
            )
            .bind(serde_json::to_string(&result)?)
            .bind(fmt_ts(now))
            .bind(serde_json::to_string(&attempts)?)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            self.load_task(task_id)
                .await?
                .ok_or_else(|| anyhow!("task vanished after complete"))
        })
        .await
        .map_err(|e| remap_not_found(e, "task"))
        .map_err(remap_state)
    }

    async fn fail_task(
        &self,
        task_id: &str,
        result: TaskResult,
        can_retry: bool,
    ) -> EngineResult<Task> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;
            let current = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| anyhow!("__not_found__task__{task_id}"))?;
            if current.status != "running" {
                return Err(anyhow!("__state__task '{task_id}' is not running"));
            }
            let now = Utc::now();
            let mut attempts: Vec<Attempt> = serde_json::from_str(&current.attempts)?;
            if let Some(attempt) = attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
                attempt.status = AttemptStatus::Failed;
                attempt.completed_at = Some(now);
                attempt.result = Some(result.clone());
            }
            let new_retry_count = current.retry_count + 1;
            let will_retry = can_retry && new_retry_count < current.max_retries;

            if will_retry {
                sqlx::query(
                    "UPDATE tasks SET status = 'queued', assigned_to = NULL, assigned_at = NULL,
                     lease_expires_at = NULL, retry_count = ?, attempts = ? WHERE id = ?",
                )
                .bind(new_retry_count)
                .bind(serde_json::to_string(&attempts)?)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE tasks SET status = 'failed', assigned_to = NULL, assigned_at = NULL,
                     lease_expires_at = NULL, retry_count = ?, result = ?, failed_at = ?,
                     attempts = ? WHERE id = ?",
                )
                .bind(new_retry_count)
                .bind(serde_json::to_string(&result)?)
                .bind(fmt_ts(now))
                .bind(serde_json::to_string(&attempts)?)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            self.load_task(task_id)
                .await?
                .ok_or_else(|| anyhow!("task vanished after fail"))
        })
        .await
        .map_err(|e| remap_not_found(e, "task"))
        .map_err(remap_state)
    }

    async fn extend_lease(&self, task_id: &str, minutes: i64) -> EngineResult<Task> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;
            let current = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| anyhow!("__not_found__task__{task_id}"))?;
            if current.status != "running" {
                return Err(anyhow!("__state__task '{task_id}' is not running"));
            }
            let current_expiry = current
                .lease_expires_at
                .clone()
                .ok_or_else(|| anyhow!("__state__running task has no lease"))?;
            let extended = parse_ts(&current_expiry)? + chrono::Duration::minutes(minutes);
            let mut attempts: Vec<Attempt> = serde_json::from_str(&current.attempts)?;
            if let Some(attempt) = attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
                attempt.lease_expires_at = extended;
            }
            sqlx::query("UPDATE tasks SET lease_expires_at = ?, attempts = ? WHERE id = ?")
                .bind(fmt_ts(extended))
                .bind(serde_json::to_string(&attempts)?)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            self.load_task(task_id)
                .await?
                .ok_or_else(|| anyhow!("task vanished after extend_lease"))
        })
        .await
        .map_err(|e| remap_not_found(e, "task"))
        .map_err(remap_state)
    }

    async fn requeue_task(&self, task_id: &str) -> EngineResult<Task> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;
            let current = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| anyhow!("__not_found__task__{task_id}"))?;
            if current.status != "running" {
                return Err(anyhow!("__state__task '{task_id}' is not running"));
            }
            let now = Utc::now();
            let mut attempts: Vec<Attempt> = serde_json::from_str(&current.attempts)?;
            if let Some(attempt) = attempts.iter_mut().rev().find(|a| a.status == AttemptStatus::Running) {
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
            sqlx::query(
                "UPDATE tasks SET status = 'queued', assigned_to = NULL, assigned_at = NULL,
                 lease_expires_at = NULL, retry_count = retry_count + 1, attempts = ? WHERE id = ?",
            )
            .bind(serde_json::to_string(&attempts)?)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            self.load_task(task_id)
                .await?
                .ok_or_else(|| anyhow!("task vanished after requeue"))
        })
        .await
        .map_err(|e| remap_not_found(e, "task"))
        .map_err(remap_state)
    }

    async fn find_expired_leases(&self) -> EngineResult<Vec<Task>> {
        with_timeout(async {
            let now = fmt_ts(Utc::now());
            let rows: Vec<TaskRow> = sqlx::query_as(
                "SELECT * FROM tasks WHERE status = 'running' AND lease_expires_at < ?",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn find_expired_leases_in_project(&self, project_id: &str) -> EngineResult<Vec<Task>> {
        with_timeout(async {
            let now = fmt_ts(Utc::now());
            let rows: Vec<TaskRow> = sqlx::query_as(
                "SELECT * FROM tasks WHERE project_id = ? AND status = 'running'
                 AND lease_expires_at < ?",
            )
            .bind(project_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn find_running_task_for_worker(
        &self,
        project_id: &str,
        worker_name: &str,
    ) -> EngineResult<Option<Task>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, TaskRow>(
                "SELECT * FROM tasks WHERE project_id = ? AND status = 'running'
                 AND assigned_to = ? LIMIT 1",
            )
            .bind(project_id)
            .bind(worker_name)
            .fetch_optional(&self.pool)
            .await?;
            row.map(TaskRow::into_task).transpose()
        })
        .await
    }

    async fn list_running_tasks(&self, project_id: &str) -> EngineResult<Vec<Task>> {
        with_timeout(async {
            let rows: Vec<TaskRow> = sqlx::query_as(
                "SELECT * FROM tasks WHERE project_id = ? AND status = 'running'",
            )
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn health_check(&self) -> EngineResult<HealthStatus> {
        with_timeout(async {
            sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
            Ok(HealthStatus {
                healthy: true,
                message: "sqlite backend OK".to_string(),
            })
        })
        .await
        .or_else(|e: EngineError| {
            Ok(HealthStatus {
                healthy: false,
                message: e.to_string(),
            })
        })
    }

    async fn get_metrics(&self) -> EngineResult<BTreeMap<String, f64>> {
        with_timeout(async {
            let mut metrics = BTreeMap::new();
            for (label, table) in
                [("projects", "projects"), ("task_types", "task_types"), ("tasks", "tasks")]
            {
                let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
                    .fetch_one(&self.pool)
                    .await?;
                let n: i64 = row.try_get("n")?;
                metrics.insert(label.to_string(), n as f64);
            }
            Ok(metrics)
        })
        .await
    }

    async fn create_session(&self, session: Session) -> EngineResult<Session> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO sessions (id, agent_name, data, created_at, expires_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&session.id)
            .bind(&session.agent_name)
            .bind(serde_json::to_string(&session.data)?)
            .bind(fmt_ts(session.created_at))
            .bind(fmt_ts(session.expires_at))
            .execute(&self.pool)
            .await?;
            Ok(session)
        })
        .await
    }

    async fn get_session(&self, id: &str) -> EngineResult<Option<Session>> {
        with_timeout(async {
            let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(row_to_session).transpose()
        })
        .await
    }

    async fn update_session(&self, id: &str, data: serde_json::Value) -> EngineResult<Session> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET data = ? WHERE id = ?")
                .bind(serde_json::to_string(&data)?)
                .bind(id)
                .execute(&self.pool)
                .await?;
            let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| anyhow!("__not_found__session__{id}"))?;
            row_to_session(row)
        })
        .await
        .map_err(|e| remap_not_found(e, "session"))
    }

    async fn delete_session(&self, id: &str) -> EngineResult<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn find_sessions_by_agent(&self, agent_name: &str) -> EngineResult<Vec<Session>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT * FROM sessions WHERE agent_name = ?")
                .bind(agent_name)
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(row_to_session).collect()
        })
        .await
    }

    async fn cleanup_expired_sessions(&self) -> EngineResult<i64> {
        with_timeout(async {
            let now = fmt_ts(Utc::now());
            let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
                .bind(now)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() as i64)
        })
        .await
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    let data: String = row.try_get("data")?;
    Ok(Session {
        id: row.try_get("id")?,
        agent_name: row.try_get("agent_name")?,
        data: serde_json::from_str(&data)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        expires_at: parse_ts(&row.try_get::<String, _>("expires_at")?)?,
    })
}

/// Translate the `__conflict__`/`__not_found__`/`__state__` sentinels used
/// above into typed `EngineError` variants, so storage callers never see raw
/// `anyhow::Error` for the conditions the command layer needs to
/// distinguish.
fn remap_conflict(err: EngineError) -> EngineError {
    if let EngineError::Storage(inner) = &err {
        if let Some(msg) = inner.to_string().strip_prefix("__conflict__") {
            return EngineError::conflict(msg.to_string());
        }
    }
    err
}

fn remap_not_found(err: EngineError, kind: &'static str) -> EngineError {
    if let EngineError::Storage(inner) = &err {
        let text = inner.to_string();
        if let Some(rest) = text.strip_prefix(&format!("__not_found__{kind}__")) {
            return EngineError::not_found(kind, rest.to_string());
        }
    }
    err
}

fn remap_state(err: EngineError) -> EngineError {
    if let EngineError::Storage(inner) = &err {
        if let Some(msg) = inner.to_string().strip_prefix("__state__") {
            return EngineError::state(msg.to_string());
        }
    }
    err
}
