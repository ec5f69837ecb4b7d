//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按 system prompt 中的角色标签（如 `[role:planner]`）匹配预置回复；
//! 同一角色的回复按顺序消费，最后一条会被重复使用。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CompletionOptions, LlmClient, LlmError, Message, Role};

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct MockCall {
    pub role: String,
    pub prompt: String,
    pub options: CompletionOptions,
}

/// 脚本化客户端：role -> 回复队列
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, LlmError>>>>,
    calls: Mutex<Vec<MockCall>>,
}

/// 从 system 消息中取出 `[role:xxx]` 标签
pub fn role_tag(messages: &[Message]) -> Option<String> {
    let system = messages.iter().find(|m| m.role == Role::System)?;
    let start = system.content.find("[role:")? + "[role:".len();
    let end = system.content[start..].find(']')? + start;
    Some(system.content[start..end].to_string())
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为角色追加一条成功回复
    pub fn on(self, role: &str, response: impl Into<String>) -> Self {
        self.push(role, Ok(response.into()));
        self
    }

    /// 为角色追加一次失败
    pub fn on_error(self, role: &str, err: LlmError) -> Self {
        self.push(role, Err(err));
        self
    }

    pub fn push(&self, role: &str, response: Result<String, LlmError>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(role.to_string()).or_default().push_back(response);
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 某角色被调用的次数
    pub fn call_count(&self, role: &str) -> usize {
        self.calls().iter().filter(|c| c.role == role).count()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, LlmError> {
        let role = role_tag(messages).unwrap_or_default();
        let prompt = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                role: role.clone(),
                prompt,
                options,
            });
        }

        let mut scripts = self
            .scripts
            .lock()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;
        let queue = scripts
            .get_mut(&role)
            .ok_or_else(|| LlmError::ApiError(format!("no scripted response for role '{role}'")))?;
        match queue.len() {
            0 => Err(LlmError::ApiError(format!("script for role '{role}' is empty"))),
            1 => queue.front().cloned().unwrap_or(Err(LlmError::Timeout)),
            _ => queue.pop_front().unwrap_or(Err(LlmError::Timeout)),
        }
    }
}
