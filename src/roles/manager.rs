//! Manager：每个回合根据页面观察选出下一个动作

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::AgentError;
use crate::env::{PageSnapshot, TabHandle};
use crate::knowledge::LearnedTool;
use crate::llm::{DecisionClient, DecisionRequest};
use crate::roles::action::ManagerDecision;
use crate::roles::schema::manager_decision_schema_json;

const SYSTEM_HEAD: &str = "[role:manager]\n\
You drive a web browser to accomplish the user's goal, one action per turn. \
Work on the current plan step. Use ANSWER once the goal is achieved, PARTIAL_SUCCESS when only part of it can be done, \
and FAIL only when the goal is impossible. Use LONG_WAIT for slow external events. \
When the page shows a newly generated password or secret, use SAVE_CREDENTIAL_VALUE. \
To type a saved credential write {{credential:NAME}}.\n\
Reply with one JSON object matching this schema:\n";

/// 一个回合交给 Manager 的上下文
pub struct ManagerContext<'a> {
    pub goal: &'a str,
    pub plan: &'a [String],
    pub current_step: usize,
    pub scratchpad_tail: &'a [String],
    pub tabs: &'a BTreeMap<String, TabHandle>,
    pub active_tab: Option<&'a str>,
    pub page: &'a PageSnapshot,
    pub learned_tool: Option<&'a LearnedTool>,
}

impl ManagerContext<'_> {
    fn render(&self) -> String {
        let mut s = format!("Goal: {}\n\nPlan:\n", self.goal);
        for (i, step) in self.plan.iter().enumerate() {
            let marker = if i == self.current_step { "->" } else { "  " };
            s.push_str(&format!("{marker} {}. {step}\n", i + 1));
        }
        if !self.scratchpad_tail.is_empty() {
            s.push_str("\nRecent notes:\n");
            for entry in self.scratchpad_tail {
                s.push_str(&format!("- {entry}\n"));
            }
        }
        let tabs: Vec<&str> = self.tabs.keys().map(String::as_str).collect();
        s.push_str(&format!(
            "\nTabs: [{}] (active: {})\n",
            tabs.join(", "),
            self.active_tab.unwrap_or("none")
        ));
        if let Some(tool) = self.learned_tool {
            s.push_str(&format!("\n{}\n", tool.to_prompt()));
        }
        s.push_str("\nCurrent page:\n");
        s.push_str(&self.page.to_prompt());
        s
    }
}

pub struct Manager {
    client: Arc<DecisionClient>,
    system: String,
}

impl Manager {
    pub fn new(client: Arc<DecisionClient>) -> Self {
        Self {
            client,
            system: format!("{SYSTEM_HEAD}{}", manager_decision_schema_json()),
        }
    }

    pub async fn decide(&self, ctx: &ManagerContext<'_>) -> Result<ManagerDecision, AgentError> {
        self.client
            .call_json(&DecisionRequest::structured(self.system.clone(), ctx.render()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, RetryPolicy};
    use crate::roles::action::Action;
    use std::time::Duration;

    #[tokio::test]
    async fn test_decide_renders_context() {
        let mock = Arc::new(MockLlmClient::new().on(
            "manager",
            r##"{"thought": "click buy", "action": "CLICK", "selector": "#buy"}"##,
        ));
        let manager = Manager::new(Arc::new(DecisionClient::new(
            mock.clone(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        )));
        let plan = vec!["open shop".to_string(), "buy".to_string()];
        let tabs = BTreeMap::from([("main".to_string(), TabHandle("tab-1".into()))]);
        let page = PageSnapshot {
            url: "https://shop.example.com".into(),
            title: "Shop".into(),
            ..PageSnapshot::default()
        };
        let ctx = ManagerContext {
            goal: "buy a kettle",
            plan: &plan,
            current_step: 1,
            scratchpad_tail: &[],
            tabs: &tabs,
            active_tab: Some("main"),
            page: &page,
            learned_tool: None,
        };
        let decision = manager.decide(&ctx).await.unwrap();
        assert!(matches!(decision.action, Action::Click { ref selector, .. } if selector == "#buy"));
        let prompt = &mock.calls()[0].prompt;
        assert!(prompt.contains("-> 2. buy"));
        assert!(prompt.contains("active: main"));
    }
}
