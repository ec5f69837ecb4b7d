//! Triage：判断目标走动作流程还是专家辩论流程

use std::sync::Arc;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::{DecisionClient, DecisionRequest};

const SYSTEM: &str = "[role:triage]\n\
Classify the user's goal. Answer \"debate\" when it asks for deliberation, strategy or \
a decision between options with no web action required; otherwise \"action\".\n\
Return JSON: {\"route\": \"action\" | \"debate\"}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Action,
    Debate,
}

#[derive(Deserialize)]
struct TriageReply {
    route: Route,
}

pub struct Triage {
    client: Arc<DecisionClient>,
}

impl Triage {
    pub fn new(client: Arc<DecisionClient>) -> Self {
        Self { client }
    }

    pub async fn route(&self, goal: &str) -> Result<Route, AgentError> {
        let reply: TriageReply = self
            .client
            .call_json(&DecisionRequest::structured(SYSTEM, format!("Goal: {goal}")))
            .await?;
        Ok(reply.route)
    }
}
