//! 核心编排层：错误与恢复、任务状态、事件、会话监管、状态机与回合循环

pub mod companion;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_store;
mod turn;

pub use companion::CompanionRelay;
pub use error::{AgentError, RecoveryAction};
pub use events::{Command, Event, Internal};
pub use orchestrator::{create_orchestrator, Collaborators, Orchestrator};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{ResearchData, Task, TaskSnapshot, TaskStatus};
pub use task_store::TaskStore;
