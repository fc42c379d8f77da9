//! `questload` — a lease-based task dispatch and orchestration engine.
//!
//! The engine (`model`, `storage`, `services`, `command`) is the queue core:
//! projects/task-types/tasks, the atomic assignment protocol, lease
//! lifecycle, and the pluggable storage abstraction. `cli`, `rest`, and `mcp`
//! are thin adapters that translate their native input into `CommandArgs`
//! and dispatch through the `command` registry — the only abstraction that
//! crosses the core/shell boundary.

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod mcp;
pub mod model;
pub mod rest;
pub mod services;
pub mod storage;
pub mod templating;

use std::sync::Arc;

use services::{AgentService, LeaseService, ProjectService, ReaperRegistry, TaskService, TaskTypeService};
use storage::StorageProvider;

/// Shared application state: every service, handed to the command registry
/// and to every shell (CLI/HTTP/MCP) that dispatches through it.
#[derive(Clone)]
pub struct EngineContext {
    pub storage: Arc<dyn StorageProvider>,
    pub projects: Arc<ProjectService>,
    pub task_types: Arc<TaskTypeService>,
    pub tasks: Arc<TaskService>,
    pub lease: Arc<LeaseService>,
    pub agents: Arc<AgentService>,
    pub reapers: Arc<ReaperRegistry>,
    pub started_at: std::time::Instant,
}

impl EngineContext {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        let projects = Arc::new(ProjectService::new(storage.clone()));
        let task_types = Arc::new(TaskTypeService::new(storage.clone(), projects.clone()));
        let tasks = Arc::new(TaskService::new(storage.clone(), projects.clone(), task_types.clone()));
        let lease = Arc::new(LeaseService::new(storage.clone(), projects.clone()));
        let agents = Arc::new(AgentService::new(storage.clone(), projects.clone()));
        let reapers = Arc::new(ReaperRegistry::new(lease.clone(), projects.clone()));
        Self {
            storage,
            projects,
            task_types,
            tasks,
            lease,
            agents,
            reapers,
            started_at: std::time::Instant::now(),
        }
    }
}
