//! Project Service (C3).
//!
//! Thin layer over `StorageProvider` enforcing name uniqueness, project
//! status gating, and default propagation to dependent entities. Every other
//! service calls `validate_project_access` first — it is the sole gate that
//! resolves a project by id-or-name and rejects missing/closed projects.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{EngineError, EngineResult};
use crate::model::{Project, ProjectConfig, ProjectStatus};
use crate::storage::{ProjectPatch, StorageProvider};
use crate::templating;

pub struct ProjectService {
    storage: Arc<dyn StorageProvider>,
}

impl ProjectService {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
        instructions: Option<String>,
        max_retries: Option<i64>,
        lease_duration_minutes: Option<i64>,
        reaper_interval_minutes: Option<i64>,
    ) -> EngineResult<Project> {
        templating::validate_name("name", name)?;
        let max_retries = max_retries.unwrap_or(3);
        let lease_duration_minutes = lease_duration_minutes.unwrap_or(10);
        let reaper_interval_minutes = reaper_interval_minutes.unwrap_or(1);
        templating::validate_min("maxRetries", max_retries, 0)?;
        templating::validate_min("leaseDurationMinutes", lease_duration_minutes, 1)?;
        templating::validate_min("reaperIntervalMinutes", reaper_interval_minutes, 1)?;

        let now = Utc::now();
        let project = Project {
            id: crate::model::new_id(),
            name: name.to_string(),
            description: description.to_string(),
            instructions,
            status: ProjectStatus::Active,
            config: ProjectConfig {
                default_max_retries: max_retries,
                default_lease_duration_minutes: lease_duration_minutes,
                reaper_interval_minutes,
            },
            created_at: now,
            updated_at: now,
            stats: Default::default(),
        };
        self.storage.create_project(project).await
    }

    /// Resolve a project by id, falling back to name, and fail fast if it is
    /// missing or closed. The gate every downstream service calls first.
    pub async fn validate_project_access(&self, id_or_name: &str) -> EngineResult<Project> {
        let project = self.find(id_or_name).await?;
        if project.status == ProjectStatus::Closed {
            return Err(EngineError::state(format!(
                "project '{id_or_name}' is closed"
            )));
        }
        Ok(project)
    }

    /// Same resolution as `validate_project_access` but without the
    /// active-status gate — used by reads that should still work against a
    /// closed project (e.g. `get_project`, `get_project_stats`).
    pub async fn find(&self, id_or_name: &str) -> EngineResult<Project> {
        if let Some(project) = self.storage.get_project(id_or_name).await? {
            return Ok(project);
        }
        self.storage
            .get_project_by_name(id_or_name)
            .await?
            .ok_or_else(|| EngineError::not_found("project", id_or_name))
    }

    pub async fn get_project(&self, id_or_name: &str) -> EngineResult<Project> {
        self.find(id_or_name).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_project(
        &self,
        id_or_name: &str,
        name: Option<String>,
        description: Option<String>,
        instructions: Option<Option<String>>,
        status: Option<ProjectStatus>,
        max_retries: Option<i64>,
        lease_duration_minutes: Option<i64>,
        reaper_interval_minutes: Option<i64>,
    ) -> EngineResult<Project> {
        let project = self.find(id_or_name).await?;
        if let Some(name) = &name {
            templating::validate_name("name", name)?;
        }
        if let Some(v) = max_retries {
            templating::validate_min("maxRetries", v, 0)?;
        }
        if let Some(v) = lease_duration_minutes {
            templating::validate_min("leaseDurationMinutes", v, 1)?;
        }
        if let Some(v) = reaper_interval_minutes {
            templating::validate_min("reaperIntervalMinutes", v, 1)?;
        }
        let patch = ProjectPatch {
            name,
            description,
            instructions,
            status,
            default_max_retries: max_retries,
            default_lease_duration_minutes: lease_duration_minutes,
            reaper_interval_minutes,
        };
        self.storage.update_project(&project.id, patch).await
    }

    pub async fn list_projects(&self, include_closed: bool) -> EngineResult<Vec<Project>> {
        self.storage.list_projects(include_closed).await
    }

    pub async fn get_project_stats(&self, id_or_name: &str) -> EngineResult<crate::model::ProjectStats> {
        Ok(self.find(id_or_name).await?.stats)
    }

    pub async fn delete_project(&self, id_or_name: &str) -> EngineResult<()> {
        let project = self.find(id_or_name).await?;
        self.storage.delete_project(&project.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorageProvider;

    fn service() -> ProjectService {
        ProjectService::new(Arc::new(InMemoryStorageProvider::new()))
    }

    #[tokio::test]
    async fn create_and_fetch_roundtrips() {
        let svc = service();
        let created = svc
            .create_project("demo", "a demo project", None, None, None, None)
            .await
            .unwrap();
        let fetched = svc.get_project(&created.id).await.unwrap();
        assert_eq!(fetched.name, "demo");
        assert_eq!(fetched.config.default_max_retries, 3);
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let svc = service();
        svc.create_project("demo", "", None, None, None, None)
            .await
            .unwrap();
        let err = svc
            .create_project("demo", "", None, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn closed_project_rejected_by_access_gate() {
        let svc = service();
        let project = svc
            .create_project("demo", "", None, None, None, None)
            .await
            .unwrap();
        svc.update_project(
            &project.id,
            None,
            None,
            None,
            Some(ProjectStatus::Closed),
            None,
            None,
            None,
        )
        .await
        .unwrap();
        let err = svc.validate_project_access(&project.id).await.unwrap_err();
        assert_eq!(err.kind(), "state");
    }

    #[tokio::test]
    async fn invalid_name_rejected() {
        let svc = service();
        let err = svc
            .create_project("bad name!", "", None, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
