//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定计入步骤失败 / 部分成功收尾 / 等待口令 / 终止。

use thiserror::Error;

use crate::env::EnvError;
use crate::llm::LlmError;
use crate::vault::VaultError;

/// 编排过程中可能出现的错误（决策服务、解析、环境、安全否决、凭据库）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Decision service error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    /// JSON 合法但不符合角色约定（如计划为空字符串、未知动作）
    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvError),

    #[error("Observation timed out after {0}s")]
    ObservationTimeout(u64),

    #[error("Navigation vetoed: {0}")]
    SecurityVeto(String),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Debate failed: {0}")]
    Debate(String),
}

impl AgentError {
    /// 决策服务额度耗尽：唯一会直接结束任务的错误
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, AgentError::Llm(LlmError::CapacityExhausted(_)))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 计入当前步骤失败（累计到阈值后重规划）
    CountStepFailure(String),
    /// 立即经 Presenter 以部分成功结束
    PartialSuccess(String),
    /// 挂起任务，等待用户输入凭据库口令
    AwaitPassphrase(String),
    /// 终止当前任务
    Abort(String),
}
