//! Task Service (C5).
//!
//! Creates tasks (single and bulk, with template materialization and
//! duplicate handling), resolves effective instructions on read, and
//! deletes/lists tasks with type-name annotation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::error::{EngineError, EngineResult};
use crate::model::{DuplicateHandling, Task, TaskStatus};
use crate::storage::{StorageProvider, TaskFilter};
use crate::templating;

use super::project::ProjectService;
use super::task_type::TaskTypeService;

const MAX_BULK_ENTRIES: usize = 1000;
const MAX_SEQUENCE_ATTEMPTS: i64 = 10_000;

/// A single entry in a `create_tasks_bulk` request — the same shape as the
/// options accepted by `create_task`, minus the project (shared by the
/// whole batch).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewTaskSpec {
    #[serde(rename = "type")]
    pub type_id_or_name: Option<String>,
    pub id: Option<String>,
    #[serde(default)]
    pub description: String,
    pub instructions: Option<String>,
    pub variables: Option<BTreeMap<String, String>>,
}

/// A task annotated with its type's name, as returned by `list_tasks`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskWithTypeName {
    #[serde(flatten)]
    pub task: Task,
    pub type_name: String,
}

#[derive(Debug, serde::Serialize)]
pub struct BulkCreateResult {
    pub tasks_created: usize,
    pub errors: Vec<String>,
    pub created_tasks: Vec<Task>,
}

pub struct TaskService {
    storage: Arc<dyn StorageProvider>,
    projects: Arc<ProjectService>,
    task_types: Arc<TaskTypeService>,
}

impl TaskService {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        projects: Arc<ProjectService>,
        task_types: Arc<TaskTypeService>,
    ) -> Self {
        Self {
            storage,
            projects,
            task_types,
        }
    }

    pub async fn create_task(
        &self,
        project_id_or_name: &str,
        spec: NewTaskSpec,
    ) -> EngineResult<Task> {
        let project = self.projects.validate_project_access(project_id_or_name).await?;
        let task_type = match &spec.type_id_or_name {
            Some(t) => self.task_types.resolve(&project.id, t).await?,
            None => {
                let mut types = self.task_types.list_task_types(&project.id).await?;
                types.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                types
                    .into_iter()
                    .next()
                    .ok_or_else(|| EngineError::validation("type", "project has no task types"))?
            }
        };
        self.create_task_of_type(&project.id, &task_type.id, spec).await
    }

    async fn create_task_of_type(
        &self,
        project_id: &str,
        type_id: &str,
        spec: NewTaskSpec,
    ) -> EngineResult<Task> {
        let task_type = self.task_types.get_task_type(type_id).await?;

        let (instructions, variables) = match &task_type.template {
            Some(template) => {
                let variables = spec.variables.clone().unwrap_or_default();
                // Materialization is validated eagerly (missing placeholders
                // must error at create time) but never persisted — reads
                // recompute via `effective_instructions`.
                templating::interpolate(template, &variables)?;
                (None, Some(variables))
            }
            None => {
                let instructions = spec.instructions.clone().ok_or_else(|| {
                    EngineError::validation("instructions", "required for non-template task types")
                })?;
                (Some(instructions), None)
            }
        };

        if task_type.duplicate_handling != DuplicateHandling::Allow {
            if let Some(variables) = &variables {
                let existing = self
                    .storage
                    .find_duplicate_task(project_id, type_id, variables)
                    .await?;
                if let Some(existing) = existing {
                    return match task_type.duplicate_handling {
                        DuplicateHandling::Ignore => Ok(existing),
                        DuplicateHandling::Fail => Err(EngineError::conflict(format!(
                            "a non-failed task with identical variables already exists: '{}'",
                            existing.id
                        ))),
                        DuplicateHandling::Allow => unreachable!(),
                    };
                }
            }
        }

        let id = match spec.id {
            Some(id) => {
                if self.storage.get_task(&id).await?.is_some() {
                    return Err(EngineError::conflict(format!(
                        "task id '{id}' already exists"
                    )));
                }
                id
            }
            None => self.generate_task_id(project_id).await?,
        };

        let now = Utc::now();
        let task = Task {
            id,
            project_id: project_id.to_string(),
            type_id: type_id.to_string(),
            description: spec.description,
            status: TaskStatus::Queued,
            instructions,
            variables,
            assigned_to: None,
            assigned_at: None,
            lease_expires_at: None,
            retry_count: 0,
            max_retries: task_type.max_retries,
            attempts: Vec::new(),
            result: None,
            created_at: now,
            completed_at: None,
            failed_at: None,
        };
        self.storage.create_task(task).await
    }

    async fn generate_task_id(&self, project_id: &str) -> EngineResult<String> {
        for _ in 0..MAX_SEQUENCE_ATTEMPTS {
            let n = self.storage.next_task_sequence(project_id).await?;
            let candidate = format!("task-{n}");
            if self.storage.get_task(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(EngineError::conflict(
            "exhausted auto-generated task id attempts",
        ))
    }

    pub async fn create_tasks_bulk(
        &self,
        project_id_or_name: &str,
        specs: Vec<NewTaskSpec>,
    ) -> EngineResult<BulkCreateResult> {
        if specs.len() > MAX_BULK_ENTRIES {
            return Err(EngineError::validation(
                "tasks",
                format!("at most {MAX_BULK_ENTRIES} entries allowed per bulk request"),
            ));
        }
        let project = self.projects.validate_project_access(project_id_or_name).await?;

        let mut errors = Vec::new();
        let mut created_tasks = Vec::new();
        for spec in specs {
            match self.create_task(&project.id, spec).await {
                Ok(task) => created_tasks.push(task),
                Err(e) => errors.push(e.to_string()),
            }
        }
        Ok(BulkCreateResult {
            tasks_created: created_tasks.len(),
            errors,
            created_tasks,
        })
    }

    pub async fn get_task(&self, task_id: &str) -> EngineResult<Task> {
        self.storage
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))
    }

    /// Interpolates the task's type template with its bound variables when
    /// no instructions are stored; returns stored instructions otherwise.
    pub async fn effective_instructions(&self, task: &Task) -> EngineResult<String> {
        if let Some(instructions) = &task.instructions {
            return Ok(instructions.clone());
        }
        let task_type = self.task_types.get_task_type(&task.type_id).await?;
        let template = task_type
            .template
            .ok_or_else(|| EngineError::state("task type has no template to interpolate"))?;
        let variables = task.variables.clone().unwrap_or_default();
        templating::interpolate(&template, &variables)
    }

    pub async fn list_tasks(
        &self,
        project_id_or_name: &str,
        filter: TaskFilter,
    ) -> EngineResult<Vec<TaskWithTypeName>> {
        let project = self.projects.find(project_id_or_name).await?;
        let tasks = self.storage.list_tasks(&project.id, filter).await?;
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            let type_name = self
                .task_types
                .get_task_type(&task.type_id)
                .await
                .map(|t| t.name)
                .unwrap_or_default();
            out.push(TaskWithTypeName { task, type_name });
        }
        Ok(out)
    }

    pub async fn delete_task(&self, task_id: &str) -> EngineResult<()> {
        self.storage.delete_task(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorageProvider;

    async fn setup() -> (Arc<ProjectService>, Arc<TaskTypeService>, TaskService) {
        let storage: Arc<dyn StorageProvider> = Arc::new(InMemoryStorageProvider::new());
        let projects = Arc::new(ProjectService::new(storage.clone()));
        let task_types = Arc::new(TaskTypeService::new(storage.clone(), projects.clone()));
        let tasks = TaskService::new(storage, projects.clone(), task_types.clone());
        (projects, task_types, tasks)
    }

    fn spec(instructions: &str) -> NewTaskSpec {
        NewTaskSpec {
            type_id_or_name: None,
            id: None,
            description: String::new(),
            instructions: Some(instructions.to_string()),
            variables: None,
        }
    }

    #[tokio::test]
    async fn template_task_materializes_and_recomputes_on_read() {
        let (projects, task_types, tasks) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        task_types
            .create_task_type(
                &project.id,
                "greet",
                Some("do {{x}}".to_string()),
                None,
                DuplicateHandling::Allow,
                None,
                None,
            )
            .await
            .unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), "A".to_string());
        let created = tasks
            .create_task(
                &project.id,
                NewTaskSpec {
                    type_id_or_name: None,
                    id: Some("task-1".to_string()),
                    description: String::new(),
                    instructions: None,
                    variables: Some(vars),
                },
            )
            .await
            .unwrap();
        assert!(created.instructions.is_none());
        let effective = tasks.effective_instructions(&created).await.unwrap();
        assert_eq!(effective, "do A");
    }

    #[tokio::test]
    async fn auto_generated_id_is_sequential() {
        let (projects, task_types, tasks) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        task_types
            .create_task_type(&project.id, "t1", None, None, DuplicateHandling::Allow, None, None)
            .await
            .unwrap();
        let a = tasks.create_task(&project.id, spec("do a")).await.unwrap();
        let b = tasks.create_task(&project.id, spec("do b")).await.unwrap();
        assert_eq!(a.id, "task-1");
        assert_eq!(b.id, "task-2");
    }

    #[tokio::test]
    async fn duplicate_fail_rejects_unless_prior_failed() {
        let (projects, task_types, tasks) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        task_types
            .create_task_type(
                &project.id,
                "t1",
                Some("{{k}}".to_string()),
                None,
                DuplicateHandling::Fail,
                None,
                None,
            )
            .await
            .unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("k".to_string(), "v".to_string());
        let first = tasks
            .create_task(
                &project.id,
                NewTaskSpec {
                    type_id_or_name: None,
                    id: None,
                    description: String::new(),
                    instructions: None,
                    variables: Some(vars.clone()),
                },
            )
            .await
            .unwrap();
        let err = tasks
            .create_task(
                &project.id,
                NewTaskSpec {
                    type_id_or_name: None,
                    id: None,
                    description: String::new(),
                    instructions: None,
                    variables: Some(vars.clone()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // Mark the first task failed directly via storage, then the same
        // variables should be allowed again.
        // (exercised at the integration level against the lease engine in
        // `tests/`; here we only check the rejection path.)
        let _ = first;
    }

    #[tokio::test]
    async fn missing_template_variable_rejected_at_create() {
        let (projects, task_types, tasks) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        task_types
            .create_task_type(
                &project.id,
                "t1",
                Some("do {{x}}".to_string()),
                None,
                DuplicateHandling::Allow,
                None,
                None,
            )
            .await
            .unwrap();
        let err = tasks
            .create_task(
                &project.id,
                NewTaskSpec {
                    type_id_or_name: None,
                    id: None,
                    description: String::new(),
                    instructions: None,
                    variables: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn bulk_reports_partial_success() {
        let (projects, task_types, tasks) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        task_types
            .create_task_type(&project.id, "t1", None, None, DuplicateHandling::Allow, None, None)
            .await
            .unwrap();
        let specs = vec![
            spec("do a"),
            NewTaskSpec {
                type_id_or_name: None,
                id: None,
                description: String::new(),
                instructions: None, // missing instructions on a non-template type -> error
                variables: None,
            },
            spec("do c"),
        ];
        let result = tasks.create_tasks_bulk(&project.id, specs).await.unwrap();
        assert_eq!(result.tasks_created, 2);
        assert_eq!(result.errors.len(), 1);
    }
}
