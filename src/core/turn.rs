//! 回合循环：研究 → 规划 → 观察 / 决策 / 执行 → 失败计数与重规划 → 呈现
//!
//! 每个函数处理完当前一步后返回下一个内部事件，由编排器队列继续驱动。

use std::sync::OnceLock;
use std::time::Instant;

use chrono::Utc;
use regex::Regex;
use tokio::time::timeout;

use super::orchestrator::{Next, Orchestrator};
use crate::core::events::{Event, Internal};
use crate::core::state::TaskStatus;
use crate::core::{AgentError, RecoveryAction};
use crate::env::{host_of, ActionSpec, EnvError, TabHandle};
use crate::roles::planner::{is_last_resort, ReplanContext};
use crate::roles::verifier::is_trusted;
use crate::roles::{Action, ManagerContext, OutcomeKind, Presentation};

fn credential_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*credential:([^}]+)\}\}")
            .unwrap_or_else(|_| Regex::new("$^").expect("regex"))
    })
}

impl Orchestrator {
    // ---- 研究与规划 ----

    pub(super) async fn research(&mut self) -> Next {
        let Some(goal) = self.store.get().map(|t| t.goal.clone()) else {
            return None;
        };
        self.transition(TaskStatus::Researching);
        let related = self.knowledge.related_completed(&goal, 3);
        let research = match self.roles.researcher.research(&goal, &related).await {
            Ok(research) => research,
            Err(e) if e.is_capacity_exhausted() => return self.on_error(e, None).await,
            Err(e) => {
                tracing::warn!(error = %e, "research failed, continuing without facts");
                self.log(format!("Research unavailable: {e}"));
                Default::default()
            }
        };
        let needs_credentials = research.needs_credentials;
        self.store.mutate(|t| {
            for fact in &research.facts {
                t.log(format!("Fact: {fact}"));
            }
            t.research = research;
        });

        if needs_credentials && self.vault.is_locked().await {
            self.log("This task needs saved credentials. Unlock the vault to continue.");
            self.transition(TaskStatus::AwaitingPassphrase);
            return None;
        }
        self.after_research().await
    }

    /// 研究完成（或凭据库已解锁）之后：直接回答或生成计划
    pub(super) async fn after_research(&mut self) -> Next {
        let Some(task) = self.store.get() else {
            return None;
        };
        if !task.research.requires_browser {
            return self.present(OutcomeKind::Answer, "").await;
        }
        let goal = task.goal.clone();
        let research = task.research.clone();
        let excluded = task.excluded_hosts(self.settings.host_failure_threshold);
        self.transition(TaskStatus::Planning);

        let related = self.knowledge.related_completed(&goal, 3);
        let plan = match self
            .roles
            .planner
            .plan(&goal, &research, &related, &excluded)
            .await
        {
            Ok(plan) => plan,
            Err(e) if e.is_capacity_exhausted() => return self.on_error(e, None).await,
            Err(e) => {
                tracing::warn!(error = %e, "planning failed, using the goal as a single step");
                vec![goal.clone()]
            }
        };
        if plan.is_empty() {
            return self.present(OutcomeKind::Answer, "").await;
        }
        self.store.mutate(|t| {
            t.log(format!("Plan: {}", plan.join(" | ")));
            t.replace_plan(plan);
        });
        self.transition(TaskStatus::Thinking);
        self.next(Internal::AdvanceTurn)
    }

    // ---- 回合 ----

    pub(super) async fn advance_turn(&mut self) -> Next {
        let Some(task) = self.store.get() else {
            return None;
        };
        if task.status != TaskStatus::Thinking {
            tracing::debug!(status = %task.status, "turn skipped");
            return None;
        }
        if task.turn >= self.settings.max_turns {
            let reason = format!(
                "Reached the limit of {} turns before finishing.",
                self.settings.max_turns
            );
            return self.present(OutcomeKind::PartialSuccess, &reason).await;
        }

        let tab = match self.ensure_tab().await {
            Ok(tab) => tab,
            Err(e) => return self.on_error(e, None).await,
        };

        let limit = self.settings.observation_timeout();
        let page = match timeout(limit, self.gateway.snapshot(&tab)).await {
            Ok(Ok(page)) => page.truncated(&self.settings.snapshot),
            Ok(Err(e)) => return self.on_error(e.into(), None).await,
            Err(_) => {
                return self
                    .on_error(AgentError::ObservationTimeout(limit.as_secs()), None)
                    .await
            }
        };
        let page_host = page.host();

        let decision = {
            let Some(task) = self.store.get() else {
                return None;
            };
            let query = task.current_step_text().unwrap_or(&task.goal);
            let learned = self.knowledge.match_tool(page_host.as_deref(), query);
            let ctx = ManagerContext {
                goal: &task.goal,
                plan: &task.plan,
                current_step: task.current_step,
                scratchpad_tail: task.scratchpad_tail(self.settings.scratchpad_tail),
                tabs: &task.tabs,
                active_tab: task.active_tab.as_deref(),
                page: &page,
                learned_tool: learned.as_ref(),
            };
            self.roles.manager.decide(&ctx).await
        };
        // 决策服务的失败不归咎于当前站点
        let decision = match decision {
            Ok(decision) => decision,
            Err(e) => return self.on_error(e, None).await,
        };

        self.store.mutate(|t| {
            t.turn += 1;
            if !decision.thought.trim().is_empty() {
                t.log(format!("Thought: {}", decision.thought.trim()));
            }
            t.log(format!("Action: {}", decision.action.describe()));
        });
        self.dispatch(decision.action, page_host).await
    }

    /// 任务还没有标签页时在起始页打开一个
    async fn ensure_tab(&mut self) -> Result<TabHandle, AgentError> {
        if let Some(tab) = self.store.get().and_then(|t| t.active_handle().cloned()) {
            return Ok(tab);
        }
        let tab = self.gateway.create_tab(&self.settings.start_url).await?;
        self.store.mutate(|t| {
            t.tabs.insert("main".to_string(), tab.clone());
            t.active_tab = Some("main".to_string());
        });
        Ok(tab)
    }

    /// 按动作类型分派；所有分支都在这里穷尽
    async fn dispatch(&mut self, action: Action, page_host: Option<String>) -> Next {
        if let Some(url) = action.target_url() {
            let url = url.to_string();
            if let Err(e) = self.vet_navigation(&url).await {
                return self.on_error(e, host_of(&url)).await;
            }
        }

        match action {
            Action::OpenTab { tab_name, url } => {
                self.transition(TaskStatus::Executing);
                match self.gateway.create_tab(&url).await {
                    Ok(tab) => {
                        self.store.mutate(|t| {
                            t.tabs.insert(tab_name.clone(), tab);
                            t.active_tab = Some(tab_name.clone());
                        });
                        self.step_succeeded(format!("Opened tab {tab_name} at {url}."))
                    }
                    Err(e) => self.on_error(e.into(), host_of(&url)).await,
                }
            }
            Action::SwitchTab { tab_name } => {
                let handle = self.store.get().and_then(|t| t.tabs.get(&tab_name).cloned());
                let Some(handle) = handle else {
                    return self.on_error(EnvError::NoSuchTab(tab_name).into(), None).await;
                };
                self.transition(TaskStatus::Executing);
                match self.gateway.switch_tab(&handle).await {
                    Ok(()) => {
                        self.store.mutate(|t| t.active_tab = Some(tab_name.clone()));
                        self.step_succeeded(format!("Switched to tab {tab_name}."))
                    }
                    Err(e) => self.on_error(e.into(), None).await,
                }
            }
            Action::Search { query } => {
                let tab = match self.resolve_tab(None) {
                    Ok(tab) => tab,
                    Err(e) => return self.on_error(e, None).await,
                };
                match self
                    .gateway
                    .semantic_search(&tab, &query, self.search_top_k)
                    .await
                {
                    Ok(hits) if hits.is_empty() => {
                        self.step_succeeded(format!("Search \"{query}\" found nothing on this page."))
                    }
                    Ok(hits) => self.step_succeeded(format!(
                        "Search \"{query}\" found:\n{}",
                        hits.join("\n---\n")
                    )),
                    Err(e) => self.on_error(e.into(), None).await,
                }
            }
            Action::Record { note } => self.step_succeeded(format!("Noted: {note}")),
            Action::LongWait => self.long_wait(),
            Action::SaveCredentialValue { value } => {
                self.pending_credential = Some(value);
                self.log("A credential appeared on the page. Name it to save it.");
                self.transition(TaskStatus::AwaitingCredentialName);
                None
            }
            Action::Answer { text } => self.present(OutcomeKind::Answer, &text).await,
            Action::PartialSuccess { reason } => {
                self.present(OutcomeKind::PartialSuccess, &reason).await
            }
            Action::Fail { reason } => self.fail(reason).await,
            primitive @ (Action::Navigate { .. }
            | Action::Click { .. }
            | Action::Type { .. }
            | Action::Submit { .. }
            | Action::Scroll { .. }) => self.execute_primitive(primitive, page_host).await,
        }
    }

    /// 不在受信任名单内的导航目的地交给 Verifier；判定不安全即否决
    async fn vet_navigation(&mut self, url: &str) -> Result<(), AgentError> {
        let mut trusted_hosts = self.settings.trusted_hosts.clone();
        trusted_hosts.extend(host_of(&self.settings.start_url));
        if host_of(url).is_some_and(|h| is_trusted(&h, &trusted_hosts)) {
            return Ok(());
        }

        self.transition(TaskStatus::Verifying);
        let Some(task) = self.store.get() else {
            return Ok(());
        };
        let verdict = self
            .roles
            .verifier
            .check(&task.goal, task.current_step_text(), url)
            .await;
        match verdict {
            Ok(v) if v.safe => {
                tracing::info!(%url, "navigation approved");
                Ok(())
            }
            Ok(v) => Err(AgentError::SecurityVeto(format!("{url}: {}", v.reason))),
            Err(e) if e.is_capacity_exhausted() => Err(e),
            Err(e) => Err(AgentError::SecurityVeto(format!(
                "{url}: could not be verified ({e})"
            ))),
        }
    }

    /// 动作指定的标签页，未指定时用当前活动页
    fn resolve_tab(&self, name: Option<&str>) -> Result<TabHandle, AgentError> {
        let task = self
            .store
            .get()
            .ok_or_else(|| AgentError::InvalidDecision("no active task".into()))?;
        let handle = match name {
            Some(name) => task.tabs.get(name),
            None => task.active_handle(),
        };
        handle.cloned().ok_or_else(|| {
            EnvError::NoSuchTab(name.or(task.active_tab.as_deref()).unwrap_or("main").to_string())
                .into()
        })
    }

    /// 把 `{{credential:NAME}}` 替换为凭据库中的值；同时返回用到的明文，供结果脱敏
    async fn resolve_credentials(&self, text: &str) -> Result<(String, Vec<String>), AgentError> {
        let mut out = String::with_capacity(text.len());
        let mut revealed = Vec::new();
        let mut last = 0;
        for caps in credential_regex().captures_iter(text) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self.vault.reveal(name.as_str().trim()).await?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(&value);
            last = whole.end();
            revealed.push(value);
        }
        out.push_str(&text[last..]);
        Ok((out, revealed))
    }

    async fn execute_primitive(&mut self, action: Action, page_host: Option<String>) -> Next {
        let Some(mut spec) = action.to_spec() else {
            return self
                .on_error(
                    AgentError::InvalidDecision(format!("{} is not a browser primitive", action.kind())),
                    None,
                )
                .await;
        };
        let tab = match self.resolve_tab(spec.tab_name.as_deref()) {
            Ok(tab) => tab,
            Err(e) => return self.on_error(e, None).await,
        };
        let mut secrets = Vec::new();
        if let Some(text) = spec.text.take() {
            match self.resolve_credentials(&text).await {
                Ok((resolved, revealed)) => {
                    spec.text = Some(resolved);
                    secrets = revealed;
                }
                Err(e) => return self.on_error(e, None).await,
            }
        }
        let failure_host = action.target_url().and_then(host_of).or_else(|| page_host.clone());

        self.transition(TaskStatus::Executing);
        let start = Instant::now();
        let result = self.gateway.execute(&tab, &spec).await;
        audit(&spec, result.is_ok(), start);

        match result {
            Ok(outcome) => {
                if let Err(e) = self.gateway.wait_for_load(&tab).await {
                    tracing::debug!(error = %e, "wait_for_load failed after action");
                }
                let landed = outcome
                    .url
                    .as_deref()
                    .and_then(host_of)
                    .filter(|host| Some(host) != page_host.as_ref());
                let message = if outcome.message.is_empty() {
                    format!("{} done.", action.kind())
                } else {
                    secrets
                        .iter()
                        .filter(|s| !s.is_empty())
                        .fold(outcome.message, |m, s| m.replace(s.as_str(), "[redacted]"))
                };
                match landed {
                    Some(host) => self.step_succeeded(format!("Result: {message} (now on {host})")),
                    None => self.step_succeeded(format!("Result: {message}")),
                }
            }
            Err(e) => self.on_error(e.into(), failure_host).await,
        }
    }

    fn long_wait(&mut self) -> Next {
        let generation = self.store.generation()?;
        let delay = self.settings.long_wait();
        let resume_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.mutate(|t| {
            t.pending_wait = Some(resume_at);
            t.log(format!("Waiting {}s before looking again.", delay.as_secs()));
        });
        self.transition(TaskStatus::Waiting);
        self.supervisor.defer(
            delay,
            self.internal_tx.clone(),
            Event::internal(generation, Internal::WaitElapsed),
        );
        None
    }

    pub(super) fn on_wait_elapsed(&mut self) -> Next {
        if self.status() != Some(TaskStatus::Waiting) {
            tracing::debug!("wait elapsed outside WAITING, ignored");
            return None;
        }
        self.supervisor.cancel_pending();
        self.store.mutate(|t| t.pending_wait = None);
        self.step_succeeded("Finished waiting.")
    }

    // ---- 成功 / 失败计数 ----

    pub(super) fn step_succeeded(&mut self, message: impl Into<String>) -> Next {
        let message = message.into();
        self.store.mutate(|t| {
            t.log(message);
            t.advance_step();
        });
        self.transition(TaskStatus::Thinking);
        self.next(Internal::AdvanceTurn)
    }

    fn step_failed(&mut self, reason: String, host: Option<String>) -> Next {
        let threshold = self.settings.step_failure_threshold;
        let count = self.store.mutate(|t| {
            t.step_failure_count += 1;
            if let Some(host) = &host {
                let strikes = t.record_host_failure(host);
                tracing::info!(%host, strikes, "site failure recorded");
            }
            t.log(format!(
                "Step {} failed ({}/{threshold}): {reason}",
                t.current_step + 1,
                t.step_failure_count
            ));
            t.step_failure_count
        })?;

        if count >= threshold {
            self.transition(TaskStatus::Replanning);
            self.next(Internal::Replan {
                user_initiated: false,
            })
        } else {
            self.transition(TaskStatus::Thinking);
            self.next(Internal::AdvanceTurn)
        }
    }

    /// 经恢复引擎把错误落到状态机上
    pub(super) async fn on_error(&mut self, err: AgentError, host: Option<String>) -> Next {
        tracing::warn!(error = %err, host = ?host, "turn error");
        match self.recovery.handle(&err) {
            RecoveryAction::CountStepFailure(reason) => self.step_failed(reason, host),
            RecoveryAction::PartialSuccess(reason) => {
                self.present(OutcomeKind::PartialSuccess, &reason).await
            }
            RecoveryAction::AwaitPassphrase(reason) => {
                self.log(format!("{reason}. Unlock the vault to continue."));
                self.transition(TaskStatus::AwaitingPassphrase);
                None
            }
            RecoveryAction::Abort(reason) => self.fail(reason).await,
        }
    }

    // ---- 重规划 ----

    pub(super) async fn replan(&mut self, user_initiated: bool) -> Next {
        let Some(task) = self.store.get() else {
            return None;
        };
        if task.status != TaskStatus::Replanning {
            tracing::debug!(status = %task.status, "replan skipped");
            return None;
        }
        if task.replan_count >= self.settings.max_replans {
            let reason = format!(
                "Gave up after {} replans without reaching the goal.",
                self.settings.max_replans
            );
            return self.present(OutcomeKind::PartialSuccess, &reason).await;
        }

        let excluded = task.excluded_hosts(self.settings.host_failure_threshold);
        let plan = {
            let ctx = ReplanContext {
                failed_plan: &task.plan,
                failing_step: task.current_step + 1,
                recent_history: task.scratchpad_tail(self.settings.scratchpad_tail),
                host_failures: &task.website_failures,
                excluded_hosts: &excluded,
                user_initiated,
            };
            self.roles.planner.replan(&task.goal, &ctx).await
        };
        self.store.mutate(|t| t.replan_count += 1);

        let plan = match plan {
            Ok(plan) => plan,
            Err(e) if e.is_capacity_exhausted() => return self.on_error(e, None).await,
            Err(e) => {
                let reason = format!("Replanning failed: {e}");
                return self.present(OutcomeKind::PartialSuccess, &reason).await;
            }
        };
        if plan.is_empty() || is_last_resort(&plan) {
            return self
                .present(
                    OutcomeKind::PartialSuccess,
                    "No remaining approach looks viable.",
                )
                .await;
        }
        if !excluded.is_empty() {
            self.log(format!("Excluded sites: {}", excluded.join(", ")));
        }
        self.store.mutate(|t| {
            t.log(format!("New plan: {}", plan.join(" | ")));
            t.replace_plan(plan);
        });
        self.transition(TaskStatus::Thinking);
        self.next(Internal::AdvanceTurn)
    }

    // ---- 收尾 ----

    /// 经 Presenter 合成答复并结束任务；Presenter 失败时用研究结果或 scratchpad 兜底
    pub(super) async fn present(&mut self, kind: OutcomeKind, reason: &str) -> Next {
        let Some(task) = self.store.get() else {
            return None;
        };
        let presentation = match self.roles.presenter.synthesize(task, kind, reason).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "presenter failed, using fallback summary");
                Presentation::fallback(task, kind, reason)
            }
        };
        let goal = task.goal.clone();
        let partial = kind == OutcomeKind::PartialSuccess;

        self.supervisor.cancel_pending();
        self.pending_credential = None;
        self.store.mutate(|t| {
            t.log(if partial {
                "Finished with a partial result."
            } else {
                "Finished."
            });
            t.final_answer = Some(presentation.summary.clone());
            t.call_to_action = presentation.call_to_action.clone();
            t.is_partial_success = partial;
            t.pending_wait = None;
        });
        self.knowledge
            .archive(&goal, TaskStatus::Completed, Some(presentation.summary.clone()));
        if !partial {
            self.knowledge.record_completed(&goal, &presentation.summary);
        }
        self.persist_knowledge().await;
        let (prompt, completion, total) = self.roles.token_usage();
        tracing::info!(prompt, completion, total, partial, "task finished");
        self.transition(TaskStatus::Completed);
        None
    }

    pub(super) async fn fail(&mut self, reason: impl Into<String>) -> Next {
        let reason = reason.into();
        let goal = self.store.get()?.goal.clone();
        self.supervisor.cancel_pending();
        self.pending_credential = None;
        self.store.mutate(|t| {
            t.log(format!("Failed: {reason}"));
            t.failure_reason = Some(reason.clone());
            t.pending_wait = None;
        });
        self.knowledge.archive(&goal, TaskStatus::Failed, Some(reason));
        self.persist_knowledge().await;
        self.transition(TaskStatus::Failed);
        None
    }
}

/// 每次原语动作输出一条 JSON 审计日志（不含输入文本，避免凭据落盘）
fn audit(spec: &ActionSpec, ok: bool, start: Instant) {
    let audit = serde_json::json!({
        "event": "env_audit",
        "action": spec.action,
        "selector": spec.selector,
        "url": spec.url,
        "tab": spec.tab_name,
        "ok": ok,
        "duration_ms": start.elapsed().as_millis() as u64,
    });
    tracing::info!(audit = %audit, "env");
}
