//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient；错误统一为 LlmError，
//! 由 DecisionClient 判断是否瞬时错误并决定重试。

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

/// 后端调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out")]
    Timeout,

    /// 额度耗尽：不可重试，编排器据此直接以部分成功结束任务
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 是否为可重试的瞬时错误（限流、不可用、超时）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Unavailable(_) | LlmError::Timeout
        )
    }

    /// 根据后端错误文本粗略归类（各家 OpenAI 兼容端点的错误码不完全一致）
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("insufficient_quota")
            || lower.contains("quota exceeded")
            || lower.contains("insufficient balance")
            || lower.contains("billing")
        {
            LlmError::CapacityExhausted(message.to_string())
        } else if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
            LlmError::RateLimited { retry_after_ms: 0 }
        } else if lower.contains("503")
            || lower.contains("502")
            || lower.contains("overloaded")
            || lower.contains("unavailable")
            || lower.contains("connection")
        {
            LlmError::Unavailable(message.to_string())
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else {
            LlmError::ApiError(message.to_string())
        }
    }
}

/// 单次请求选项：是否要求 JSON 结果、是否允许外部知识工具（如联网搜索）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionOptions {
    pub json: bool,
    pub allow_search: bool,
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quota_is_capacity() {
        let err = LlmError::classify("insufficient_quota: You exceeded your current quota");
        assert!(matches!(err, LlmError::CapacityExhausted(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_transient() {
        assert!(LlmError::classify("HTTP 429 rate limit reached").is_transient());
        assert!(LlmError::classify("503 Service Unavailable").is_transient());
        assert!(LlmError::classify("operation timed out").is_transient());
        assert!(!LlmError::classify("invalid api key").is_transient());
    }
}
