//! Researcher：规划前收集事实，并判断是否需要浏览器 / 已保存的凭据
//!
//! 允许决策服务使用外部检索工具（allow_search）。

use std::sync::Arc;

use crate::core::{AgentError, ResearchData};
use crate::knowledge::CompletedTask;
use crate::llm::{DecisionClient, DecisionRequest};

const SYSTEM: &str = "[role:researcher]\n\
Gather the facts needed for the goal before any browsing happens. \
If the goal can be answered from the facts alone, set requires_browser to false. \
Set needs_credentials to true when the goal requires logging in with a saved account.\n\
Return JSON: {\"facts\": [string], \"requires_browser\": bool, \"needs_credentials\": bool, \"summary\": string}";

pub struct Researcher {
    client: Arc<DecisionClient>,
}

impl Researcher {
    pub fn new(client: Arc<DecisionClient>) -> Self {
        Self { client }
    }

    pub async fn research(
        &self,
        goal: &str,
        related: &[CompletedTask],
    ) -> Result<ResearchData, AgentError> {
        let mut user = format!("Goal: {goal}\n");
        if !related.is_empty() {
            user.push_str("\nPreviously completed similar tasks:\n");
            for c in related {
                user.push_str(&format!("- {} => {}\n", c.goal, c.answer));
            }
        }
        self.client
            .call_json(&DecisionRequest::structured(SYSTEM, user).with_search())
            .await
    }
}
