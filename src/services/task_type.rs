//! TaskType Service (C4).
//!
//! Validates the owning project via C3, reconciles `variables` against the
//! template's placeholders via C2, and enforces unique `(projectId, name)`
//! and a delete guard against tasks still referencing the type.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{EngineError, EngineResult};
use crate::model::{DuplicateHandling, TaskType};
use crate::storage::{StorageProvider, TaskTypePatch};
use crate::templating;

use super::project::ProjectService;

pub struct TaskTypeService {
    storage: Arc<dyn StorageProvider>,
    projects: Arc<ProjectService>,
}

impl TaskTypeService {
    pub fn new(storage: Arc<dyn StorageProvider>, projects: Arc<ProjectService>) -> Self {
        Self { storage, projects }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_task_type(
        &self,
        project_id_or_name: &str,
        name: &str,
        template: Option<String>,
        variables: Option<Vec<String>>,
        duplicate_handling: DuplicateHandling,
        max_retries: Option<i64>,
        lease_duration_minutes: Option<i64>,
    ) -> EngineResult<TaskType> {
        let project = self.projects.validate_project_access(project_id_or_name).await?;
        templating::validate_name("name", name)?;

        let template = template.filter(|t| !t.is_empty());
        let variables = templating::reconcile_variables(template.as_deref(), variables)?;

        let max_retries = max_retries.unwrap_or(project.config.default_max_retries);
        let lease_duration_minutes =
            lease_duration_minutes.unwrap_or(project.config.default_lease_duration_minutes);
        templating::validate_min("maxRetries", max_retries, 0)?;
        templating::validate_min("leaseDurationMinutes", lease_duration_minutes, 1)?;

        let now = Utc::now();
        let task_type = TaskType {
            id: crate::model::new_id(),
            project_id: project.id.clone(),
            name: name.to_string(),
            template,
            variables,
            duplicate_handling,
            max_retries,
            lease_duration_minutes,
            created_at: now,
            updated_at: now,
        };
        self.storage.create_task_type(task_type).await
    }

    pub async fn get_task_type(&self, type_id: &str) -> EngineResult<TaskType> {
        self.storage
            .get_task_type(type_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task_type", type_id))
    }

    /// Resolve a task type by id or by `(project, name)` — used by
    /// `create_task`'s "first type if absent" default and by callers that
    /// pass a human-friendly type name instead of an id.
    pub async fn resolve(&self, project_id: &str, id_or_name: &str) -> EngineResult<TaskType> {
        if let Some(t) = self.storage.get_task_type(id_or_name).await? {
            return Ok(t);
        }
        self.storage
            .get_task_type_by_name(project_id, id_or_name)
            .await?
            .ok_or_else(|| EngineError::not_found("task_type", id_or_name))
    }

    pub async fn list_task_types(&self, project_id_or_name: &str) -> EngineResult<Vec<TaskType>> {
        let project = self.projects.find(project_id_or_name).await?;
        self.storage.list_task_types(&project.id).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_task_type(
        &self,
        type_id: &str,
        name: Option<String>,
        template: Option<Option<String>>,
        variables: Option<Vec<String>>,
        duplicate_handling: Option<DuplicateHandling>,
        max_retries: Option<i64>,
        lease_duration_minutes: Option<i64>,
    ) -> EngineResult<TaskType> {
        let current = self.get_task_type(type_id).await?;
        if let Some(name) = &name {
            templating::validate_name("name", name)?;
        }
        if let Some(v) = max_retries {
            templating::validate_min("maxRetries", v, 0)?;
        }
        if let Some(v) = lease_duration_minutes {
            templating::validate_min("leaseDurationMinutes", v, 1)?;
        }

        let effective_template = template.clone().unwrap_or_else(|| current.template.clone());
        let variables = if template.is_some() || variables.is_some() {
            Some(templating::reconcile_variables(
                effective_template.as_deref(),
                variables,
            )?)
        } else {
            None
        };

        let patch = TaskTypePatch {
            name,
            template,
            variables,
            duplicate_handling,
            max_retries,
            lease_duration_minutes,
        };
        self.storage.update_task_type(type_id, patch).await
    }

    pub async fn delete_task_type(&self, type_id: &str) -> EngineResult<()> {
        let count = self.storage.count_tasks_for_type(type_id).await?;
        if count > 0 {
            return Err(EngineError::state(format!(
                "task type '{type_id}' still has {count} task(s) referencing it"
            )));
        }
        self.storage.delete_task_type(type_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorageProvider;

    async fn setup() -> (Arc<ProjectService>, TaskTypeService) {
        let storage: Arc<dyn StorageProvider> = Arc::new(InMemoryStorageProvider::new());
        let projects = Arc::new(ProjectService::new(storage.clone()));
        let types = TaskTypeService::new(storage, projects.clone());
        (projects, types)
    }

    #[tokio::test]
    async fn derives_variables_from_template() {
        let (projects, types) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        let t = types
            .create_task_type(
                &project.id,
                "greet",
                Some("hello {{name}}".to_string()),
                None,
                DuplicateHandling::Allow,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(t.variables, vec!["name".to_string()]);
        assert_eq!(t.max_retries, 3);
    }

    #[tokio::test]
    async fn mismatched_explicit_variables_rejected() {
        let (projects, types) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        let err = types
            .create_task_type(
                &project.id,
                "greet",
                Some("hello {{name}}".to_string()),
                Some(vec!["other".to_string()]),
                DuplicateHandling::Allow,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn duplicate_name_in_project_rejected() {
        let (projects, types) = setup().await;
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        types
            .create_task_type(&project.id, "greet", None, None, DuplicateHandling::Allow, None, None)
            .await
            .unwrap();
        let err = types
            .create_task_type(&project.id, "greet", None, None, DuplicateHandling::Allow, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn delete_refuses_when_tasks_reference_type() {
        let storage = Arc::new(InMemoryStorageProvider::new());
        let projects = Arc::new(ProjectService::new(storage.clone() as Arc<dyn StorageProvider>));
        let types = TaskTypeService::new(storage.clone() as Arc<dyn StorageProvider>, projects.clone());
        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        let task_type = types
            .create_task_type(&project.id, "t1", None, None, DuplicateHandling::Allow, None, None)
            .await
            .unwrap();
        let now = chrono::Utc::now();
        storage
            .create_task(crate::model::Task {
                id: "t-1".to_string(),
                project_id: project.id.clone(),
                type_id: task_type.id.clone(),
                description: String::new(),
                status: crate::model::TaskStatus::Queued,
                instructions: Some("do it".to_string()),
                variables: None,
                assigned_to: None,
                assigned_at: None,
                lease_expires_at: None,
                retry_count: 0,
                max_retries: 3,
                attempts: vec![],
                result: None,
                created_at: now,
                completed_at: None,
                failed_at: None,
            })
            .await
            .unwrap();
        let err = types.delete_task_type(&task_type.id).await.unwrap_err();
        assert_eq!(err.kind(), "state");
    }
}
