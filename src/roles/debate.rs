//! 专家辩论：适用于需要深思而非动作的目标
//!
//! 1. 生成若干不同背景的专家 persona
//! 2. 每个 persona 独立给出候选方案排名表
//! 3. 每个 persona 看到其他人的表后给出一个修订后的首选方案
//! 4. 综合者合并为共识文档 + 可执行计划
//!
//! 同一阶段内 persona 调用并发（上限 fan_out），阶段之间串行。
//! 失败的 persona 从本轮剔除；某阶段无人幸存时整个辩论失败。

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Deserialize;

use crate::config::DebateSection;
use crate::core::AgentError;
use crate::llm::{DecisionClient, DecisionRequest};

const PERSONAS_SYSTEM: &str = "[role:debate-personas]\n\
Propose distinct expert personas who would disagree productively about the problem.\n\
Return JSON: {\"personas\": [{\"name\": string, \"expertise\": string}]}";

const CANDIDATES_SYSTEM: &str = "[role:debate-candidates]\n\
Answer in character. Produce a ranked table of candidate solutions with pros and cons.";

const REVISION_SYSTEM: &str = "[role:debate-revision]\n\
Answer in character. You have seen the other experts' tables. \
Give your single revised preferred solution and why.";

const SYNTHESIS_SYSTEM: &str = "[role:debate-synthesis]\n\
Merge the experts' revised solutions into one consensus document and a short ordered action plan.\n\
Return JSON: {\"consensus\": string, \"plan\": [string]}";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub expertise: String,
}

#[derive(Deserialize)]
struct PersonasReply {
    personas: Vec<Persona>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DebateOutcome {
    pub consensus: String,
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(skip)]
    pub personas: Vec<String>,
}

pub struct DebateOrchestrator {
    client: Arc<DecisionClient>,
    persona_count: usize,
    fan_out: usize,
}

impl DebateOrchestrator {
    pub fn new(client: Arc<DecisionClient>, cfg: &DebateSection) -> Self {
        Self {
            client,
            persona_count: cfg.persona_count.max(1),
            fan_out: cfg.fan_out.max(1),
        }
    }

    pub async fn run(&self, problem: &str) -> Result<DebateOutcome, AgentError> {
        let reply: PersonasReply = self
            .client
            .call_json(&DecisionRequest::structured(
                PERSONAS_SYSTEM,
                format!("Problem: {problem}\nNumber of personas: {}", self.persona_count),
            ))
            .await?;
        let personas: Vec<Persona> = reply
            .personas
            .into_iter()
            .filter(|p| !p.name.trim().is_empty())
            .take(self.persona_count)
            .collect();
        if personas.is_empty() {
            return Err(AgentError::Debate("no personas generated".into()));
        }
        tracing::info!(count = personas.len(), "debate personas ready");

        // 阶段一：候选方案表
        let tables = self
            .fan_out_phase(personas, |p| {
                DecisionRequest::text(
                    CANDIDATES_SYSTEM,
                    format!(
                        "You are {} ({}).\nProblem: {problem}",
                        p.name, p.expertise
                    ),
                )
            })
            .await?;

        // 阶段二：看过其他人的表后修订
        let all_tables = tables.clone();
        let revisions = self
            .fan_out_phase(tables.into_iter().map(|(p, _)| p).collect(), |p| {
                let others: Vec<String> = all_tables
                    .iter()
                    .filter(|(other, _)| other.name != p.name)
                    .map(|(other, table)| format!("## {}\n{}", other.name, table))
                    .collect();
                DecisionRequest::text(
                    REVISION_SYSTEM,
                    format!(
                        "You are {} ({}).\nProblem: {problem}\n\nOther experts' tables:\n{}",
                        p.name,
                        p.expertise,
                        others.join("\n\n")
                    ),
                )
            })
            .await?;

        // 阶段三：综合
        let merged: Vec<String> = revisions
            .iter()
            .map(|(p, rev)| format!("## {}\n{}", p.name, rev))
            .collect();
        let mut outcome: DebateOutcome = self
            .client
            .call_json(&DecisionRequest::structured(
                SYNTHESIS_SYSTEM,
                format!("Problem: {problem}\n\nRevised solutions:\n{}", merged.join("\n\n")),
            ))
            .await?;
        outcome.plan.retain(|s| !s.trim().is_empty());
        outcome.personas = revisions.into_iter().map(|(p, _)| p.name).collect();
        Ok(outcome)
    }

    /// 对每个 persona 并发调用一次（上限 fan_out），保留成功者
    async fn fan_out_phase<F>(
        &self,
        personas: Vec<Persona>,
        build: F,
    ) -> Result<Vec<(Persona, String)>, AgentError>
    where
        F: Fn(&Persona) -> DecisionRequest,
    {
        let client = &self.client;
        let results: Vec<(Persona, Result<String, AgentError>)> = stream::iter(personas)
            .map(|p| {
                let request = build(&p);
                async move {
                    let out = client.call_text(&request).await;
                    (p, out)
                }
            })
            .buffered(self.fan_out)
            .collect()
            .await;

        let mut survivors = Vec::with_capacity(results.len());
        for (p, out) in results {
            match out {
                Ok(text) => survivors.push((p, text)),
                Err(e) if e.is_capacity_exhausted() => return Err(e),
                Err(e) => tracing::warn!(persona = %p.name, error = %e, "persona dropped from debate round"),
            }
        }
        if survivors.is_empty() {
            return Err(AgentError::Debate("every persona failed in this round".into()));
        }
        Ok(survivors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, RetryPolicy};
    use std::time::Duration;

    fn orchestrator(mock: Arc<MockLlmClient>) -> DebateOrchestrator {
        let client = Arc::new(DecisionClient::new(
            mock,
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            Duration::from_secs(5),
        ));
        DebateOrchestrator::new(client, &DebateSection::default())
    }

    #[tokio::test]
    async fn test_full_debate_round() {
        let mock = Arc::new(
            MockLlmClient::new()
                .on(
                    "debate-personas",
                    r#"{"personas": [{"name": "Economist"}, {"name": "Engineer"}, {"name": "Ethicist"}]}"#,
                )
                .on("debate-candidates", "| rank | option |")
                .on("debate-revision", "Option B")
                .on(
                    "debate-synthesis",
                    r#"{"consensus": "Go with B", "plan": ["Open the site", "Compare B"]}"#,
                ),
        );
        let outcome = orchestrator(mock.clone()).run("which option?").await.unwrap();
        assert_eq!(outcome.consensus, "Go with B");
        assert_eq!(outcome.plan.len(), 2);
        assert_eq!(outcome.personas.len(), 3);
        assert_eq!(mock.call_count("debate-candidates"), 3);
        assert_eq!(mock.call_count("debate-revision"), 3);
        let revision_prompt = mock
            .calls()
            .into_iter()
            .find(|c| c.role == "debate-revision")
            .unwrap()
            .prompt;
        assert!(revision_prompt.contains("| rank | option |"));
    }

    #[tokio::test]
    async fn test_failing_personas_are_dropped() {
        let mock = Arc::new(
            MockLlmClient::new()
                .on("debate-personas", r#"{"personas": [{"name": "A"}, {"name": "B"}]}"#)
                .on_error("debate-candidates", crate::llm::LlmError::ApiError("boom".into()))
                .on("debate-candidates", "table")
                .on("debate-revision", "rev")
                .on("debate-synthesis", r#"{"consensus": "ok"}"#),
        );
        let outcome = orchestrator(mock).run("p").await.unwrap();
        assert_eq!(outcome.personas.len(), 1);
        assert!(outcome.plan.is_empty());
    }

    #[tokio::test]
    async fn test_debate_fails_when_no_persona_survives() {
        let mock = Arc::new(
            MockLlmClient::new()
                .on("debate-personas", r#"{"personas": [{"name": "A"}]}"#)
                .on_error("debate-candidates", crate::llm::LlmError::ApiError("boom".into())),
        );
        let err = orchestrator(mock).run("p").await.unwrap_err();
        assert!(matches!(err, AgentError::Debate(_)));
    }
}
