//! 伴随设备状态推送
//!
//! 每次通知时尽力 POST `{goal, status, answer}`，不等待结果；
//! 推送失败后熔断，冷却期内不再尝试。

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::CompanionSection;
use crate::core::state::TaskSnapshot;

#[derive(Debug, Serialize)]
struct StatusPush<'a> {
    goal: &'a str,
    status: String,
    answer: Option<&'a str>,
}

#[derive(Clone)]
pub struct CompanionRelay {
    client: reqwest::Client,
    endpoint: Option<String>,
    cooldown: Duration,
    tripped_until: Arc<Mutex<Option<Instant>>>,
}

impl CompanionRelay {
    pub fn from_config(cfg: &CompanionSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: cfg.endpoint.clone(),
            cooldown: Duration::from_secs(cfg.cooldown_secs),
            tripped_until: Arc::new(Mutex::new(None)),
        }
    }

    pub fn disabled() -> Self {
        Self::from_config(&CompanionSection::default())
    }

    /// 熔断中（冷却期未过）
    pub fn is_tripped(&self) -> bool {
        self.tripped_until
            .lock()
            .map(|t| t.is_some_and(|until| Instant::now() < until))
            .unwrap_or(false)
    }

    /// 非阻塞推送；需在 tokio runtime 内调用
    pub fn push(&self, snapshot: &TaskSnapshot) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        if self.is_tripped() {
            tracing::debug!("companion relay in cool-down, skipping push");
            return;
        }

        let body = match serde_json::to_value(StatusPush {
            goal: &snapshot.goal,
            status: snapshot.status.to_string(),
            answer: snapshot.final_answer.as_deref(),
        }) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "companion payload serialization failed");
                return;
            }
        };

        let client = self.client.clone();
        let tripped = Arc::clone(&self.tripped_until);
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            let result = client.post(&endpoint).json(&body).send().await;
            let failed = match result {
                Ok(resp) if resp.status().is_success() => None,
                Ok(resp) => Some(format!("HTTP {}", resp.status())),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failed {
                tracing::warn!(%reason, cooldown_secs = cooldown.as_secs(), "companion push failed, cooling down");
                if let Ok(mut until) = tripped.lock() {
                    *until = Some(Instant::now() + cooldown);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Task;

    #[tokio::test]
    async fn test_disabled_relay_never_trips() {
        let relay = CompanionRelay::disabled();
        relay.push(&TaskSnapshot::from(&Task::new("goal", 1)));
        assert!(!relay.is_tripped());
    }

    #[tokio::test]
    async fn test_failed_push_trips_breaker() {
        let relay = CompanionRelay::from_config(&CompanionSection {
            // 保留端口，连接会被拒绝
            endpoint: Some("http://127.0.0.1:9/status".into()),
            cooldown_secs: 60,
            timeout_ms: 500,
        });
        relay.push(&TaskSnapshot::from(&Task::new("goal", 1)));
        let mut tripped = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if relay.is_tripped() {
                tripped = true;
                break;
            }
        }
        assert!(tripped);
    }
}
