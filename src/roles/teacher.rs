//! Teacher：把教学时录制的动作总结成一段简短叙述
//!
//! 在后台任务中调用，结果经带代际号的内部事件送回编排器。

use std::sync::Arc;

use crate::core::AgentError;
use crate::env::RecordedAction;
use crate::llm::{DecisionClient, DecisionRequest};

const SYSTEM: &str = "[role:teacher]\n\
The user demonstrated how to do a task in the browser. Summarize the recorded actions as a short \
numbered procedure another agent could follow. Plain text only.";

#[derive(Clone)]
pub struct Teacher {
    client: Arc<DecisionClient>,
}

impl Teacher {
    pub fn new(client: Arc<DecisionClient>) -> Self {
        Self { client }
    }

    pub async fn summarize(
        &self,
        goal: &str,
        actions: &[RecordedAction],
    ) -> Result<String, AgentError> {
        let mut user = format!("Task: {goal}\n\nRecorded actions:\n");
        for (i, a) in actions.iter().enumerate() {
            user.push_str(&format!("{}. {} (on {})\n", i + 1, a.spec.describe(), a.page_url));
        }
        self.client
            .call_text(&DecisionRequest::text(SYSTEM, user))
            .await
    }
}
