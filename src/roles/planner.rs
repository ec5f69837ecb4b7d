//! Planner：初始规划与失败后的重规划
//!
//! 三振规则在两处生效：prompt 中列出排除的站点，生成结果里提到这些站点的步骤被过滤掉。
//! 重规划可以返回只有一步 `PARTIAL_SUCCESS` 的计划，表示无路可走。

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{AgentError, ResearchData};
use crate::env::host_of;
use crate::knowledge::CompletedTask;
use crate::llm::{DecisionClient, DecisionRequest};

const PLAN_SYSTEM: &str = "[role:planner]\n\
Break the goal into a short ordered list of concrete browser steps. \
Never use a site listed as excluded. Return an empty list if no browsing is needed.\n\
Return JSON: {\"steps\": [string]}";

const REPLAN_SYSTEM: &str = "[role:replanner]\n\
The current plan failed. Write a new plan that starts from the current browser state.\n\
Rules:\n\
- Three strikes: never use a site listed in excludedHosts.\n\
- Move on: if a sub-goal keeps failing, continue with the next independent sub-goal instead of stalling.\n\
- Last resort: if nothing else can work, return exactly one step: \"PARTIAL_SUCCESS\".\n\
Return JSON: {\"steps\": [string]}";

/// 最后手段：唯一一步即为此标记
pub const PARTIAL_SUCCESS_STEP: &str = "PARTIAL_SUCCESS";

#[derive(Deserialize)]
struct PlanReply {
    #[serde(alias = "plan")]
    steps: Vec<String>,
}

/// 重规划时附带的失败上下文
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplanContext<'a> {
    pub failed_plan: &'a [String],
    /// 从 1 开始
    pub failing_step: usize,
    pub recent_history: &'a [String],
    pub host_failures: &'a BTreeMap<String, u32>,
    pub excluded_hosts: &'a [String],
    pub user_initiated: bool,
}

pub struct Planner {
    client: Arc<DecisionClient>,
}

impl Planner {
    pub fn new(client: Arc<DecisionClient>) -> Self {
        Self { client }
    }

    pub async fn plan(
        &self,
        goal: &str,
        research: &ResearchData,
        related: &[CompletedTask],
        excluded_hosts: &[String],
    ) -> Result<Vec<String>, AgentError> {
        let mut user = format!("Goal: {goal}\n\nResearch facts:\n");
        for fact in &research.facts {
            user.push_str(&format!("- {fact}\n"));
        }
        if !related.is_empty() {
            user.push_str("\nSimilar completed tasks:\n");
            for c in related {
                user.push_str(&format!("- {} => {}\n", c.goal, c.answer));
            }
        }
        if !excluded_hosts.is_empty() {
            user.push_str(&format!("\nExcluded sites: {}\n", excluded_hosts.join(", ")));
        }
        let reply: PlanReply = self
            .client
            .call_json(&DecisionRequest::structured(PLAN_SYSTEM, user))
            .await?;
        Ok(clean_steps(reply.steps, excluded_hosts))
    }

    pub async fn replan(
        &self,
        goal: &str,
        ctx: &ReplanContext<'_>,
    ) -> Result<Vec<String>, AgentError> {
        let context = serde_json::to_string_pretty(ctx)
            .map_err(|e| AgentError::InvalidDecision(e.to_string()))?;
        let user = format!("Goal: {goal}\n\nFailure context:\n{context}");
        let reply: PlanReply = self
            .client
            .call_json(&DecisionRequest::structured(REPLAN_SYSTEM, user))
            .await?;
        Ok(clean_steps(reply.steps, ctx.excluded_hosts))
    }
}

/// 去空白、去空步，并过滤提到排除站点的步骤
fn clean_steps(steps: Vec<String>, excluded_hosts: &[String]) -> Vec<String> {
    let steps: Vec<String> = steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let (kept, dropped) = filter_excluded(steps, excluded_hosts);
    if dropped > 0 {
        tracing::info!(dropped, "removed plan steps that reference excluded sites");
    }
    kept
}

fn host_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:https?://)?(?:www\.)?[a-z0-9-]+(?:\.[a-z0-9-]+)+")
            .unwrap_or_else(|_| Regex::new("$^").expect("regex"))
    })
}

/// 步骤里提到的所有站点
pub fn hosts_in(step: &str) -> Vec<String> {
    host_regex()
        .find_iter(step)
        .filter_map(|m| host_of(m.as_str()))
        .collect()
}

fn references_host(step: &str, host: &str) -> bool {
    let lower = step.to_lowercase();
    lower.contains(host)
        || hosts_in(step)
            .iter()
            .any(|h| h == host || h.ends_with(&format!(".{host}")))
}

/// 返回 (保留的步骤, 被过滤的步骤数)
pub fn filter_excluded(steps: Vec<String>, excluded_hosts: &[String]) -> (Vec<String>, usize) {
    if excluded_hosts.is_empty() {
        return (steps, 0);
    }
    let total = steps.len();
    let kept: Vec<String> = steps
        .into_iter()
        .filter(|s| !excluded_hosts.iter().any(|h| references_host(s, h)))
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// 计划是否为最后手段（唯一一步 PARTIAL_SUCCESS）
pub fn is_last_resort(steps: &[String]) -> bool {
    steps.len() == 1 && steps[0].trim().eq_ignore_ascii_case(PARTIAL_SUCCESS_STEP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, RetryPolicy};
    use std::time::Duration;

    fn client(mock: Arc<MockLlmClient>) -> Arc<DecisionClient> {
        Arc::new(DecisionClient::new(mock, RetryPolicy::default(), Duration::from_secs(5)))
    }

    #[test]
    fn test_filter_excluded_hosts() {
        let steps = vec![
            "Open https://www.tickets.example.com/search".to_string(),
            "Search for concerts on otherseller.org".to_string(),
            "Compare prices".to_string(),
            "Check m.tickets.example.com for deals".to_string(),
        ];
        let (kept, dropped) = filter_excluded(steps, &["tickets.example.com".to_string()]);
        assert_eq!(dropped, 2);
        assert_eq!(kept, vec!["Search for concerts on otherseller.org", "Compare prices"]);
    }

    #[test]
    fn test_last_resort_detection() {
        assert!(is_last_resort(&["partial_success".to_string()]));
        assert!(!is_last_resort(&["PARTIAL_SUCCESS".to_string(), "x".to_string()]));
        assert!(!is_last_resort(&[]));
    }

    #[tokio::test]
    async fn test_replan_sends_failure_context_and_filters() {
        let mock = Arc::new(MockLlmClient::new().on(
            "replanner",
            r#"{"steps": ["Retry on bad.example.com", "Try good.example.org"]}"#,
        ));
        let planner = Planner::new(client(mock.clone()));
        let failures = BTreeMap::from([("bad.example.com".to_string(), 3)]);
        let excluded = vec!["bad.example.com".to_string()];
        let plan = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ctx = ReplanContext {
            failed_plan: &plan,
            failing_step: 2,
            recent_history: &[],
            host_failures: &failures,
            excluded_hosts: &excluded,
            user_initiated: false,
        };
        let steps = planner.replan("buy tickets", &ctx).await.unwrap();
        assert_eq!(steps, vec!["Try good.example.org"]);
        let prompt = &mock.calls()[0].prompt;
        assert!(prompt.contains("\"failingStep\": 2"));
        assert!(prompt.contains("\"userInitiated\": false"));
    }

    #[tokio::test]
    async fn test_plan_accepts_plan_alias() {
        let mock = Arc::new(MockLlmClient::new().on("planner", r#"{"plan": [" open site ", ""]}"#));
        let planner = Planner::new(client(mock));
        let steps = planner
            .plan("goal", &ResearchData::default(), &[], &[])
            .await
            .unwrap();
        assert_eq!(steps, vec!["open site"]);
    }
}
