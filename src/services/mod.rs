//! Services (C3–C8): thin layers over the `StorageProvider` contract that
//! add policy — name uniqueness, status gating, template materialization,
//! lease bookkeeping, the agent-view projection, and the background reaper.

pub mod agents;
pub mod lease;
pub mod project;
pub mod reaper;
pub mod task;
pub mod task_type;

pub use agents::AgentService;
pub use lease::LeaseService;
pub use project::ProjectService;
pub use reaper::ReaperRegistry;
pub use task::TaskService;
pub use task_type::TaskTypeService;
