//! LLM 层：客户端抽象、OpenAI 兼容实现、Mock、决策服务客户端（重试 + JSON 修复）

pub mod decision;
pub mod embedding;
pub mod json_repair;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use decision::{DecisionClient, DecisionOutput, DecisionRequest, RetryPolicy};
pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{CompletionOptions, LlmClient, LlmError};

use crate::config::AppConfig;

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容）；没有任何 Key 时返回 None
pub fn create_llm_from_config(cfg: &AppConfig) -> Option<Arc<dyn LlmClient>> {
    let provider = cfg.llm.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "deepseek" {
        if let Some(key) = deepseek_key.clone().or_else(|| openai_key.clone()) {
            tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
            return Some(Arc::new(OpenAiClient::deepseek(Some(&cfg.llm.model), &key)));
        }
    }
    if let Some(key) = openai_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        return Some(Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            &key,
        )));
    }
    deepseek_key.map(|key| {
        tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::deepseek(Some(&cfg.llm.model), &key)) as Arc<dyn LlmClient>
    })
}
