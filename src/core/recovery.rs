//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction：回合内的决策/环境错误一律视为可恢复的步骤失败，
//! 只有额度耗尽会强制部分成功收尾，凭据库错误则挂起任务，辩论失败直接终止。

use crate::core::{AgentError, RecoveryAction};
use crate::vault::VaultError;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        if err.is_capacity_exhausted() {
            return RecoveryAction::PartialSuccess(format!(
                "Stopped early because the decision service quota is exhausted ({err})."
            ));
        }
        match err {
            AgentError::Vault(VaultError::Locked) | AgentError::Vault(VaultError::WrongPassphrase) => {
                RecoveryAction::AwaitPassphrase(err.to_string())
            }
            AgentError::Vault(VaultError::Corrupt(msg)) => {
                RecoveryAction::AwaitPassphrase(format!("Credential store unreadable: {msg}"))
            }
            AgentError::Debate(_) => RecoveryAction::Abort(err.to_string()),
            _ => RecoveryAction::CountStepFailure(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvError;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_capacity_exhausted() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Llm(LlmError::CapacityExhausted("quota".into()));
        match engine.handle(&err) {
            RecoveryAction::PartialSuccess(msg) => assert!(msg.contains("quota")),
            other => panic!("Expected PartialSuccess, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_rate_limit_counts_as_step_failure() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Llm(LlmError::RateLimited { retry_after_ms: 1000 });
        assert!(matches!(engine.handle(&err), RecoveryAction::CountStepFailure(_)));
    }

    #[test]
    fn test_recovery_environment_and_veto() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Environment(EnvError::ElementNotFound("#buy".into()));
        assert!(matches!(engine.handle(&err), RecoveryAction::CountStepFailure(_)));
        let err = AgentError::SecurityVeto("phishing".into());
        assert!(matches!(engine.handle(&err), RecoveryAction::CountStepFailure(_)));
    }

    #[test]
    fn test_recovery_vault_suspends() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Vault(VaultError::Locked);
        assert!(matches!(engine.handle(&err), RecoveryAction::AwaitPassphrase(_)));
    }

    #[test]
    fn test_recovery_debate_failure_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Debate("every persona failed in this round".into());
        match engine.handle(&err) {
            RecoveryAction::Abort(msg) => assert!(msg.starts_with("Debate failed")),
            other => panic!("Expected Abort, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::JsonParseError("invalid json".to_string());
        match engine.handle(&err) {
            RecoveryAction::CountStepFailure(msg) => assert!(msg.contains("JSON")),
            other => panic!("Expected CountStepFailure, got {other:?}"),
        }
    }
}
