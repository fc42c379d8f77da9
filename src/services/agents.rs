//! Agent View (C7).
//!
//! A pure projection over running tasks — there is no persisted agent
//! entity. "Active agents" is just today's running-task set grouped by
//! `assignedTo`.

use std::sync::Arc;

use crate::error::EngineResult;
use crate::model::ActiveAgent;
use crate::storage::StorageProvider;

use super::project::ProjectService;

pub struct AgentService {
    storage: Arc<dyn StorageProvider>,
    projects: Arc<ProjectService>,
}

impl AgentService {
    pub fn new(storage: Arc<dyn StorageProvider>, projects: Arc<ProjectService>) -> Self {
        Self { storage, projects }
    }

    pub async fn list_active_agents(&self, project_id_or_name: &str) -> EngineResult<Vec<ActiveAgent>> {
        let project = self.projects.find(project_id_or_name).await?;
        let running = self.storage.list_running_tasks(&project.id).await?;
        let mut agents: Vec<ActiveAgent> = running
            .into_iter()
            .filter_map(|task| {
                Some(ActiveAgent {
                    name: task.assigned_to?,
                    current_task_id: task.id,
                    assigned_at: task.assigned_at?,
                    lease_expires_at: task.lease_expires_at?,
                    status: "working".to_string(),
                })
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    pub async fn get_agent_status(
        &self,
        project_id_or_name: &str,
        name: &str,
    ) -> EngineResult<Option<ActiveAgent>> {
        Ok(self
            .list_active_agents(project_id_or_name)
            .await?
            .into_iter()
            .find(|a| a.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::task::{NewTaskSpec, TaskService};
    use crate::services::task_type::TaskTypeService;
    use crate::services::lease::LeaseService;
    use crate::storage::memory::InMemoryStorageProvider;

    #[tokio::test]
    async fn active_agents_reflect_running_tasks_only() {
        let storage: Arc<dyn StorageProvider> = Arc::new(InMemoryStorageProvider::new());
        let projects = Arc::new(ProjectService::new(storage.clone()));
        let task_types = Arc::new(TaskTypeService::new(storage.clone(), projects.clone()));
        let tasks = TaskService::new(storage.clone(), projects.clone(), task_types.clone());
        let lease = LeaseService::new(storage.clone(), projects.clone());
        let agents = AgentService::new(storage.clone(), projects.clone());

        let project = projects
            .create_project("p1", "", None, None, None, None)
            .await
            .unwrap();
        task_types
            .create_task_type(
                &project.id,
                "t1",
                None,
                None,
                crate::model::DuplicateHandling::Allow,
                None,
                None,
            )
            .await
            .unwrap();
        tasks
            .create_task(
                &project.id,
                NewTaskSpec {
                    type_id_or_name: None,
                    id: None,
                    description: String::new(),
                    instructions: Some("do it".to_string()),
                    variables: None,
                },
            )
            .await
            .unwrap();

        assert!(agents.list_active_agents(&project.id).await.unwrap().is_empty());
        lease
            .get_next_task(&project.id, Some("w1".to_string()))
            .await
            .unwrap();
        let active = agents.list_active_agents(&project.id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "w1");
        assert_eq!(active[0].status, "working");
    }
}
