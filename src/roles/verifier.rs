//! Verifier：导航到不受信任站点前的安全审核
//!
//! 判定为不安全时编排器把该动作视为执行失败，不会绕过。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::{DecisionClient, DecisionRequest};

const SYSTEM: &str = "[role:verifier]\n\
You are a security reviewer for an autonomous browser agent. Decide whether navigating to the URL \
is safe and relevant to the goal. Reject phishing, malware, unrelated payment pages and obvious scams.\n\
Return JSON: {\"safe\": bool, \"reason\": string}";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Verdict {
    pub safe: bool,
    #[serde(default)]
    pub reason: String,
}

pub struct Verifier {
    client: Arc<DecisionClient>,
}

impl Verifier {
    pub fn new(client: Arc<DecisionClient>) -> Self {
        Self { client }
    }

    pub async fn check(&self, goal: &str, step: Option<&str>, url: &str) -> Result<Verdict, AgentError> {
        let user = format!(
            "Goal: {goal}\nCurrent step: {}\nTarget URL: {url}",
            step.unwrap_or("(none)")
        );
        self.client
            .call_json(&DecisionRequest::structured(SYSTEM, user))
            .await
    }
}

/// 导航目的地是否在受信任名单内（精确匹配或其子域名）
pub fn is_trusted(host: &str, trusted_hosts: &[String]) -> bool {
    trusted_hosts.iter().any(|t| {
        let t = t.trim().trim_start_matches("www.").to_lowercase();
        host == t || host.ends_with(&format!(".{t}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_hosts_match_subdomains() {
        let trusted = vec!["example.com".to_string(), "www.duckduckgo.com".to_string()];
        assert!(is_trusted("example.com", &trusted));
        assert!(is_trusted("docs.example.com", &trusted));
        assert!(is_trusted("duckduckgo.com", &trusted));
        assert!(!is_trusted("badexample.com", &trusted));
    }
}
