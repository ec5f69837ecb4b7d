//! 决策服务客户端：所有 Decision Role 共用的调用入口
//!
//! - 瞬时错误（限流 / 不可用 / 单次超时）按指数退避 + 抖动重试，次数有上限
//! - 其它错误立即返回，不重试
//! - 要求结构化结果时：解析 → 本地修复 → 至多一次「让模型自行修正」的远程修复

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::timeout;

use crate::config::LlmSection;
use crate::core::AgentError;
use crate::llm::json_repair::parse_with_local_repair;
use crate::llm::{CompletionOptions, LlmClient, LlmError, Message};

/// 退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时长（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let power = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(power);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }
        // 在 [capped/2, capped] 内抖动，避免多个调用同时重试
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped * factor)
    }
}

/// 一次决策请求
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub system: String,
    pub user: String,
    pub structured: bool,
    pub allow_search: bool,
}

impl DecisionRequest {
    pub fn structured(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            structured: true,
            allow_search: false,
        }
    }

    pub fn text(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            structured: false,
            ..Self::structured(system, user)
        }
    }

    pub fn with_search(mut self) -> Self {
        self.allow_search = true;
        self
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            json: self.structured,
            allow_search: self.allow_search,
        }
    }
}

/// 决策结果：原始文本或 JSON
#[derive(Debug, Clone)]
pub enum DecisionOutput {
    Text(String),
    Json(Value),
}

const REPAIR_PROMPT: &str = "[role:repair]\n\
You previously answered with malformed JSON. Return the same content as ONE valid JSON value. \
Output only the JSON, no commentary and no code fences.";

/// 决策服务客户端
pub struct DecisionClient {
    llm: Arc<dyn LlmClient>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl DecisionClient {
    pub fn new(llm: Arc<dyn LlmClient>, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            llm,
            policy,
            attempt_timeout,
        }
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, cfg: &LlmSection) -> Self {
        let policy = RetryPolicy {
            max_attempts: cfg.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry.base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry.max_delay_ms),
            jitter: cfg.retry.jitter,
        };
        Self::new(llm, policy, Duration::from_secs(cfg.request_timeout_secs))
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn call(&self, request: &DecisionRequest) -> Result<DecisionOutput, AgentError> {
        let messages = vec![
            Message::system(request.system.clone()),
            Message::user(request.user.clone()),
        ];
        let raw = self.complete_with_retry(&messages, request.options()).await?;
        if !request.structured {
            return Ok(DecisionOutput::Text(raw));
        }

        match parse_with_local_repair(&raw) {
            Ok(value) => Ok(DecisionOutput::Json(value)),
            Err(local_err) => {
                tracing::warn!(error = %local_err, "structured result unparseable, asking for a repair");
                let repair = vec![Message::system(REPAIR_PROMPT), Message::user(raw)];
                let repaired = self.complete_with_retry(&repair, request.options()).await?;
                parse_with_local_repair(&repaired)
                    .map(DecisionOutput::Json)
                    .map_err(AgentError::JsonParseError)
            }
        }
    }

    /// 结构化调用并反序列化为角色自己的类型
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        request: &DecisionRequest,
    ) -> Result<T, AgentError> {
        let request = DecisionRequest {
            structured: true,
            ..request.clone()
        };
        match self.call(&request).await? {
            DecisionOutput::Json(value) => serde_json::from_value(value)
                .map_err(|e| AgentError::InvalidDecision(e.to_string())),
            DecisionOutput::Text(raw) => Err(AgentError::JsonParseError(raw)),
        }
    }

    pub async fn call_text(&self, request: &DecisionRequest) -> Result<String, AgentError> {
        let request = DecisionRequest {
            structured: false,
            ..request.clone()
        };
        match self.call(&request).await? {
            DecisionOutput::Text(text) => Ok(text.trim().to_string()),
            DecisionOutput::Json(value) => Ok(value.to_string()),
        }
    }

    async fn complete_with_retry(
        &self,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, AgentError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match timeout(self.attempt_timeout, self.llm.complete(messages, options)).await {
                Ok(Ok(content)) => return Ok(content),
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout,
            };

            if !err.is_transient() || attempt >= self.policy.max_attempts {
                tracing::warn!(attempt, error = %err, "decision call failed");
                return Err(err.into());
            }

            let mut delay = self.policy.delay_for(attempt);
            if let LlmError::RateLimited { retry_after_ms } = err {
                delay = delay.max(Duration::from_millis(retry_after_ms));
            }
            tracing::info!(attempt, ?delay, error = %err, "transient decision error, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for _ in 0..20 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let mock = Arc::new(
            MockLlmClient::new()
                .on_error("triage", LlmError::Unavailable("503".into()))
                .on("triage", r#"{"route": "action"}"#),
        );
        let client = DecisionClient::new(mock.clone(), fast_policy(), Duration::from_secs(5));
        let req = DecisionRequest::structured("[role:triage]", "goal");
        let out = client.call(&req).await.unwrap();
        assert!(matches!(out, DecisionOutput::Json(_)));
        assert_eq!(mock.call_count("triage"), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempt_cap() {
        let mock = Arc::new(MockLlmClient::new().on_error("triage", LlmError::Timeout));
        let client = DecisionClient::new(mock.clone(), fast_policy(), Duration::from_secs(5));
        let err = client
            .call(&DecisionRequest::text("[role:triage]", "goal"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(LlmError::Timeout)));
        assert_eq!(mock.call_count("triage"), 3);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let mock = Arc::new(
            MockLlmClient::new().on_error("triage", LlmError::CapacityExhausted("quota".into())),
        );
        let client = DecisionClient::new(mock.clone(), fast_policy(), Duration::from_secs(5));
        let err = client
            .call(&DecisionRequest::text("[role:triage]", "goal"))
            .await
            .unwrap_err();
        assert!(err.is_capacity_exhausted());
        assert_eq!(mock.call_count("triage"), 1);
    }

    #[tokio::test]
    async fn test_single_remote_repair() {
        let mock = Arc::new(
            MockLlmClient::new()
                .on("planner", "steps: open the site, then search")
                .on("repair", r#"{"steps": ["open the site", "search"]}"#),
        );
        let client = DecisionClient::new(mock.clone(), fast_policy(), Duration::from_secs(5));
        let value = client
            .call(&DecisionRequest::structured("[role:planner]", "goal"))
            .await
            .unwrap();
        match value {
            DecisionOutput::Json(v) => assert_eq!(v["steps"][0], "open the site"),
            other => panic!("Expected Json, got {other:?}"),
        }
        assert_eq!(mock.call_count("repair"), 1);
    }

    #[tokio::test]
    async fn test_repair_not_repeated() {
        let mock = Arc::new(
            MockLlmClient::new()
                .on("planner", "not json")
                .on("repair", "still not json"),
        );
        let client = DecisionClient::new(mock.clone(), fast_policy(), Duration::from_secs(5));
        let err = client
            .call(&DecisionRequest::structured("[role:planner]", "goal"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::JsonParseError(_)));
        assert_eq!(mock.call_count("repair"), 1);
    }
}
