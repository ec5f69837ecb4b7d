//! Presenter：从 scratchpad 与研究结果合成最终答复
//!
//! 只读 scratchpad / research，不接触原始页面状态。
//! 完整答复的 call_to_action 为 None；部分成功时总是给出恢复建议。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::{AgentError, Task};
use crate::llm::{DecisionClient, DecisionRequest};

const SYSTEM: &str = "[role:presenter]\n\
Write the final answer for the user from the task notes and research facts only. \
For a partial outcome, state clearly what was done and what is missing, and suggest a next step.\n\
Return JSON: {\"summary\": string, \"call_to_action\": string | null}";

pub const DEFAULT_CALL_TO_ACTION: &str =
    "Take over in the browser, ask me to replan, or start a new task.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Answer,
    PartialSuccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Presentation {
    pub summary: String,
    #[serde(default)]
    pub call_to_action: Option<String>,
}

impl Presentation {
    /// 统一 call_to_action 的语义
    pub fn normalized(mut self, kind: OutcomeKind) -> Self {
        match kind {
            OutcomeKind::Answer => self.call_to_action = None,
            OutcomeKind::PartialSuccess => {
                if self.call_to_action.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    self.call_to_action = Some(DEFAULT_CALL_TO_ACTION.to_string());
                }
            }
        }
        self
    }

    /// Presenter 调用失败时的兜底
    pub fn fallback(task: &Task, kind: OutcomeKind, reason: &str) -> Self {
        let summary = if !reason.trim().is_empty() {
            reason.to_string()
        } else if let Some(summary) = &task.research.summary {
            summary.clone()
        } else if !task.research.facts.is_empty() {
            task.research.facts.join("\n")
        } else {
            task.scratchpad
                .last()
                .cloned()
                .unwrap_or_else(|| "Task finished.".to_string())
        };
        Self {
            summary,
            call_to_action: None,
        }
        .normalized(kind)
    }
}

pub struct Presenter {
    client: Arc<DecisionClient>,
}

impl Presenter {
    pub fn new(client: Arc<DecisionClient>) -> Self {
        Self { client }
    }

    pub async fn synthesize(
        &self,
        task: &Task,
        kind: OutcomeKind,
        reason: &str,
    ) -> Result<Presentation, AgentError> {
        let outcome = match kind {
            OutcomeKind::Answer => "full answer",
            OutcomeKind::PartialSuccess => "partial success",
        };
        let mut user = format!("Goal: {}\nOutcome: {outcome}\n", task.goal);
        if !reason.is_empty() {
            user.push_str(&format!("Agent's final note: {reason}\n"));
        }
        user.push_str("\nResearch facts:\n");
        for fact in &task.research.facts {
            user.push_str(&format!("- {fact}\n"));
        }
        user.push_str("\nTask notes:\n");
        for entry in &task.scratchpad {
            user.push_str(&format!("- {entry}\n"));
        }
        let p: Presentation = self
            .client
            .call_json(&DecisionRequest::structured(SYSTEM, user))
            .await?;
        Ok(p.normalized(kind))
    }
}
