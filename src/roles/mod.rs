//! 决策角色：各自是「任务上下文 → 决策」的纯函数，建立在 DecisionClient 之上
//!
//! 每个角色的 system prompt 以 `[role:xxx]` 标签开头，便于日志与 Mock 按角色区分。

pub mod action;
pub mod debate;
pub mod manager;
pub mod planner;
pub mod presenter;
pub mod researcher;
pub mod schema;
pub mod teacher;
pub mod triage;
pub mod verifier;

use std::sync::Arc;

use crate::config::DebateSection;
use crate::llm::DecisionClient;

pub use action::{Action, ManagerDecision, ScrollDirection};
pub use debate::{DebateOrchestrator, DebateOutcome};
pub use manager::{Manager, ManagerContext};
pub use planner::{Planner, ReplanContext};
pub use presenter::{OutcomeKind, Presentation, Presenter};
pub use researcher::Researcher;
pub use teacher::Teacher;
pub use triage::{Route, Triage};
pub use verifier::{Verdict, Verifier};

/// 编排器持有的全部角色
pub struct Roles {
    pub triage: Triage,
    pub researcher: Researcher,
    pub planner: Planner,
    pub manager: Manager,
    pub verifier: Verifier,
    pub presenter: Presenter,
    pub teacher: Teacher,
    pub debate: DebateOrchestrator,
    client: Arc<DecisionClient>,
}

impl Roles {
    /// 所有角色共用同一个决策服务客户端
    pub fn new(client: Arc<DecisionClient>, debate: &DebateSection) -> Self {
        Self {
            triage: Triage::new(client.clone()),
            researcher: Researcher::new(client.clone()),
            planner: Planner::new(client.clone()),
            manager: Manager::new(client.clone()),
            verifier: Verifier::new(client.clone()),
            presenter: Presenter::new(client.clone()),
            teacher: Teacher::new(client.clone()),
            debate: DebateOrchestrator::new(client.clone(), debate),
            client,
        }
    }

    /// 累计 token 用量 (prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.client.token_usage()
    }
}
