//! 任务编排器：事件驱动的状态机
//!
//! 负责：接收控制命令与内部 continuation，驱动 Triage → Research → Plan → 回合循环，
//! 维护唯一的当前任务，并把每次状态变化投影为 TaskSnapshot（watch 最新值 + broadcast 通知 + 伴随设备推送）。
//!
//! 每个事件处理到底后才取下一个；处理函数返回下一个事件而不是递归调用自己，
//! 由 `handle` 里的队列排空。后台任务（LONG_WAIT、教学摘要）投递带 generation 的内部事件，
//! 与当前任务不符的直接丢弃。

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::{AppConfig, OrchestratorSection};
use crate::core::events::{Command, Event, Internal};
use crate::core::state::{Task, TaskSnapshot, TaskStatus};
use crate::core::{AgentError, CompanionRelay, RecoveryEngine, SessionSupervisor, TaskStore};
use crate::env::{EnvironmentGateway, RecordedAction, TabHandle};
use crate::knowledge::KnowledgeStore;
use crate::llm::{create_embedder_from_config, create_llm_from_config, DecisionClient};
use crate::roles::{Roles, Route};
use crate::vault::{CredentialVault, MemoryVault};

/// 处理一个事件后的后续事件
pub(super) type Next = Option<Event>;

/// 编排器依赖的协作方
pub struct Collaborators {
    pub roles: Roles,
    pub gateway: Arc<dyn EnvironmentGateway>,
    pub knowledge: KnowledgeStore,
    pub vault: Arc<dyn CredentialVault>,
    pub companion: CompanionRelay,
}

pub struct Orchestrator {
    pub(super) settings: OrchestratorSection,
    pub(super) search_top_k: usize,
    pub(super) store: TaskStore,
    pub(super) roles: Roles,
    pub(super) gateway: Arc<dyn EnvironmentGateway>,
    pub(super) knowledge: KnowledgeStore,
    pub(super) vault: Arc<dyn CredentialVault>,
    pub(super) companion: CompanionRelay,
    pub(super) recovery: RecoveryEngine,
    pub(super) supervisor: SessionSupervisor,
    pub(super) internal_tx: mpsc::UnboundedSender<Event>,
    queue: VecDeque<Event>,
    /// 待命名的凭据值；只在内存中，不进入 Task，也不广播
    pub(super) pending_credential: Option<String>,
    state_tx: watch::Sender<Option<TaskSnapshot>>,
    notify_tx: broadcast::Sender<TaskSnapshot>,
}

impl Orchestrator {
    /// 创建编排器；返回的接收端承载后台任务投递回来的内部事件
    pub fn new(cfg: &AppConfig, parts: Collaborators) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(None);
        let (notify_tx, _) = broadcast::channel(256);
        let orchestrator = Self {
            settings: cfg.orchestrator.clone(),
            search_top_k: cfg.embedding.top_k,
            store: TaskStore::new(),
            roles: parts.roles,
            gateway: parts.gateway,
            knowledge: parts.knowledge,
            vault: parts.vault,
            companion: parts.companion,
            recovery: RecoveryEngine::new(),
            supervisor: SessionSupervisor::new(),
            internal_tx,
            queue: VecDeque::new(),
            pending_credential: None,
            state_tx,
            notify_tx,
        };
        (orchestrator, internal_rx)
    }

    pub fn task(&self) -> Option<&Task> {
        self.store.get()
    }

    pub fn snapshot(&self) -> Option<TaskSnapshot> {
        self.store.snapshot()
    }

    /// 每次状态变化的通知
    pub fn subscribe(&self) -> broadcast::Receiver<TaskSnapshot> {
        self.notify_tx.subscribe()
    }

    /// 最新快照（无任务时为 None）
    pub fn watch(&self) -> watch::Receiver<Option<TaskSnapshot>> {
        self.state_tx.subscribe()
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    pub fn has_pending_credential(&self) -> bool {
        self.pending_credential.is_some()
    }

    pub fn has_pending_timer(&self) -> bool {
        self.supervisor.has_pending()
    }

    /// 处理一个事件，并排空它引出的全部后续事件
    pub async fn handle(&mut self, event: Event) {
        self.queue.push_back(event);
        while let Some(event) = self.queue.pop_front() {
            if let Some(next) = self.step(event).await {
                self.queue.push_back(next);
            }
            self.publish();
        }
    }

    /// 主循环：命令通道关闭或收到 Quit 时退出
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        let shutdown = self.supervisor.cancel_token();
        loop {
            let event = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => Event::Control(cmd),
                    None => break,
                },
                Some(event) = internal_rx.recv() => event,
                _ = shutdown.cancelled() => break,
            };
            self.handle(event).await;
        }
        tracing::info!("orchestrator stopped");
    }

    async fn step(&mut self, event: Event) -> Next {
        match event {
            Event::Control(cmd) => self.on_command(cmd).await,
            Event::Internal { generation, kind } => {
                if !self.store.is_current(generation) {
                    tracing::debug!(generation, ?kind, "dropping stale internal event");
                    return None;
                }
                match kind {
                    Internal::AdvanceTurn => self.advance_turn().await,
                    Internal::WaitElapsed => self.on_wait_elapsed(),
                    Internal::Replan { user_initiated } => self.replan(user_initiated).await,
                    Internal::TeachingSummarized { summary } => {
                        self.on_teaching_summary(summary);
                        None
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) -> Next {
        match cmd {
            Command::StartTask { goal } => self.start_task(goal).await,
            Command::StopTask => {
                self.discard_task(true).await;
                None
            }
            Command::ResetTaskSession => {
                self.discard_task(false).await;
                None
            }
            Command::TakeOver => {
                self.take_over().await;
                None
            }
            Command::GoAutonomous => self.go_autonomous().await,
            Command::RecordedAction(action) => {
                self.record_action(action).await;
                None
            }
            Command::AttemptStrategy { plan } => self.attempt_strategy(plan),
            Command::StartTeaching { goal } => {
                self.start_teaching(goal).await;
                None
            }
            Command::StopTeaching => {
                self.stop_teaching().await;
                None
            }
            Command::UnlockVault { passphrase } => self.unlock_vault(&passphrase).await,
            Command::SaveCredential { name } => self.save_credential(&name).await,
            Command::DeleteHistoricalTask { timestamp } => {
                if self.knowledge.delete_history(timestamp) {
                    self.persist_knowledge().await;
                } else {
                    tracing::debug!(timestamp, "no history entry with that timestamp");
                }
                None
            }
            Command::GetTask(reply) => {
                let _ = reply.send(self.store.snapshot());
                None
            }
            Command::GetHistory(reply) => {
                let _ = reply.send(self.knowledge.history().to_vec());
                None
            }
            Command::Quit => {
                self.discard_task(false).await;
                self.supervisor.shutdown();
                None
            }
        }
    }

    // ---- 通知与小工具 ----

    /// 快照有变化时：更新 watch、广播、推送伴随设备
    pub(super) fn publish(&mut self) {
        let snapshot = self.store.snapshot();
        if *self.state_tx.borrow() == snapshot {
            return;
        }
        self.state_tx.send_replace(snapshot.clone());
        if let Some(snapshot) = snapshot {
            let _ = self.notify_tx.send(snapshot.clone());
            self.companion.push(&snapshot);
        }
    }

    pub(super) fn transition(&mut self, status: TaskStatus) {
        if let Some(task) = self.store.get_mut() {
            if task.status != status {
                tracing::info!(from = %task.status, to = %status, turn = task.turn, "task transition");
                task.status = status;
                task.touch();
            }
        }
        self.publish();
    }

    pub(super) fn log(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        self.store.mutate(|t| t.log(entry));
    }

    pub(super) fn status(&self) -> Option<TaskStatus> {
        self.store.get().map(|t| t.status)
    }

    /// 当前任务的内部后续事件
    pub(super) fn next(&self, kind: Internal) -> Next {
        self.store.generation().map(|g| Event::internal(g, kind))
    }

    pub(super) async fn persist_knowledge(&self) {
        if let Err(e) = self.knowledge.save().await {
            tracing::warn!(error = %format!("{e:#}"), "knowledge store save failed");
        }
    }

    /// 开关录制；关闭时返回页面内录到的动作（失败时为空）
    pub(super) async fn set_learning(&self, tab: &TabHandle, enabled: bool) -> Vec<RecordedAction> {
        match self.gateway.set_learning(tab, enabled).await {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::warn!(tab = %tab, enabled, error = %e, "toggling learning mode failed");
                Vec::new()
            }
        }
    }

    /// 关闭录制，并把网关录到的动作按 RECORDED_ACTION 的规则并入当前任务
    async fn collect_recording(&mut self, tab: &TabHandle) {
        let recorded = self.set_learning(tab, false).await;
        if !recorded.is_empty() {
            tracing::info!(count = recorded.len(), "collected in-page recording");
        }
        for action in recorded {
            self.record_action(action).await;
        }
    }

    // ---- 生命周期 ----

    /// 丢弃当前任务：取消延迟恢复、清空待命名凭据、未结束的任务归档。
    /// announce 为 true 时先广播 STOPPED 快照（STOP），否则静默（RESET / 被新任务替换）。
    async fn discard_task(&mut self, announce: bool) {
        let Some(task) = self.store.get() else {
            tracing::debug!("no active task, nothing to discard");
            return;
        };
        let status = task.status;
        let goal = task.goal.clone();
        let learning_tab = matches!(status, TaskStatus::Teaching | TaskStatus::UserInputPending)
            .then(|| task.active_handle().cloned())
            .flatten();

        self.supervisor.cancel_pending();
        self.pending_credential = None;
        if let Some(tab) = learning_tab {
            self.set_learning(&tab, false).await;
        }
        if !status.is_terminal() {
            let archived = if announce { TaskStatus::Stopped } else { status };
            self.knowledge.archive(&goal, archived, None);
            self.persist_knowledge().await;
        }
        if announce {
            self.store.mutate(|t| {
                t.pending_wait = None;
                t.log("Task stopped by user.");
            });
            self.transition(TaskStatus::Stopped);
        }
        self.store.clear();
        self.state_tx.send_replace(None);
        tracing::info!(%goal, announce, "task discarded");
    }

    async fn start_task(&mut self, goal: String) -> Next {
        let goal = goal.trim().to_string();
        if goal.is_empty() {
            tracing::warn!("ignoring START_TASK with an empty goal");
            return None;
        }
        self.discard_task(false).await;
        self.store.create(goal.clone());
        tracing::info!(%goal, "task started");
        self.publish();

        let route = match self.roles.triage.route(&goal).await {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(error = %e, "triage failed, defaulting to the action route");
                Route::Action
            }
        };
        match route {
            Route::Debate => self.run_debate(&goal).await,
            Route::Action => self.research().await,
        }
    }

    async fn run_debate(&mut self, goal: &str) -> Next {
        self.log("Routed to expert debate.");
        match self.roles.debate.run(goal).await {
            Ok(outcome) => {
                let personas = outcome.personas.join(", ");
                self.store.mutate(|t| {
                    t.log(format!("Debate between {personas} reached consensus."));
                    t.final_answer = Some(outcome.consensus.clone());
                    t.debate_plan = outcome.plan.clone();
                    t.is_deliberate_plan = true;
                    t.call_to_action = (!outcome.plan.is_empty())
                        .then(|| "Review the plan, then attempt the strategy to execute it.".to_string());
                });
                self.knowledge.archive(goal, TaskStatus::Completed, Some(outcome.consensus.clone()));
                self.knowledge.record_completed(goal, &outcome.consensus);
                self.persist_knowledge().await;
                self.transition(TaskStatus::Completed);
                None
            }
            Err(e) => {
                let err = match e {
                    e if e.is_capacity_exhausted() => e,
                    e @ AgentError::Debate(_) => e,
                    other => AgentError::Debate(other.to_string()),
                };
                self.on_error(err, None).await
            }
        }
    }

    /// 执行辩论得出的计划：只有显式的 ATTEMPT_STRATEGY 才会走到回合循环
    fn attempt_strategy(&mut self, plan: Vec<String>) -> Next {
        let Some(task) = self.store.get() else {
            tracing::debug!("ATTEMPT_STRATEGY without a task");
            return None;
        };
        if !task.is_deliberate_plan || task.status != TaskStatus::Completed {
            tracing::debug!(status = %task.status, "ATTEMPT_STRATEGY ignored");
            return None;
        }
        let plan: Vec<String> = if plan.is_empty() {
            task.debate_plan.clone()
        } else {
            plan
        };
        if plan.is_empty() {
            tracing::warn!("ATTEMPT_STRATEGY with no plan to execute");
            return None;
        }
        self.store.mutate(|t| {
            t.log(format!("Attempting the agreed strategy ({} steps).", plan.len()));
            t.replace_plan(plan);
            t.final_answer = None;
            t.call_to_action = None;
        });
        self.transition(TaskStatus::Thinking);
        self.next(Internal::AdvanceTurn)
    }

    // ---- 接管与教学 ----

    async fn take_over(&mut self) {
        let Some(task) = self.store.get() else {
            tracing::debug!("TAKE_OVER without a task");
            return;
        };
        let allowed = !task.status.is_terminal()
            || (task.status == TaskStatus::Completed && task.is_partial_success);
        if !allowed || matches!(task.status, TaskStatus::UserInputPending | TaskStatus::Teaching) {
            tracing::debug!(status = %task.status, "TAKE_OVER ignored");
            return;
        }
        let tab = task.active_handle().cloned();

        self.supervisor.cancel_pending();
        if let Some(tab) = &tab {
            self.set_learning(tab, true).await;
        }
        self.store.mutate(|t| {
            t.pending_wait = None;
            t.call_to_action = None;
            t.log("User took over control.");
        });
        self.transition(TaskStatus::UserInputPending);
    }

    async fn go_autonomous(&mut self) -> Next {
        let Some(task) = self.store.get() else {
            tracing::debug!("GO_AUTONOMOUS without a task");
            return None;
        };
        let allowed = task.status == TaskStatus::UserInputPending
            || (task.status == TaskStatus::Completed && task.is_partial_success);
        if !allowed {
            tracing::debug!(status = %task.status, "GO_AUTONOMOUS ignored");
            return None;
        }
        let tab = task.active_handle().cloned();
        if let Some(tab) = tab {
            self.collect_recording(&tab).await;
        }
        self.store.mutate(|t| {
            t.is_partial_success = false;
            t.final_answer = None;
            t.call_to_action = None;
            t.log("User handed control back; replanning from the current page.");
        });
        self.transition(TaskStatus::Replanning);
        self.next(Internal::Replan {
            user_initiated: true,
        })
    }

    /// 用户手动执行的动作：只记录，不执行
    async fn record_action(&mut self, action: RecordedAction) {
        let Some(task) = self.store.get() else {
            tracing::debug!("RECORDED_ACTION without a task");
            return;
        };
        match task.status {
            TaskStatus::UserInputPending => {
                let host = action.host().unwrap_or_else(|| "unknown".to_string());
                let description = task
                    .current_step_text()
                    .unwrap_or(&task.goal)
                    .to_string();
                self.knowledge.learn(&host, &description, vec![action.clone()]);
                self.persist_knowledge().await;
            }
            TaskStatus::Teaching if !task.summarizing => {}
            status => {
                tracing::debug!(%status, "RECORDED_ACTION ignored");
                return;
            }
        }
        self.store.mutate(|t| {
            t.log(format!("User: {}", action.spec.describe()));
            t.recorded_actions.push(action);
        });
    }

    async fn start_teaching(&mut self, goal: String) {
        let goal = goal.trim().to_string();
        if goal.is_empty() {
            tracing::warn!("ignoring START_TEACHING with an empty goal");
            return;
        }
        self.discard_task(false).await;
        self.store.create(goal.clone()).is_training = true;
        self.transition(TaskStatus::Teaching);

        match self.gateway.create_tab(&self.settings.start_url).await {
            Ok(tab) => {
                self.store.mutate(|t| {
                    t.tabs.insert("main".to_string(), tab.clone());
                    t.active_tab = Some("main".to_string());
                    t.log(format!("Teaching started: {goal}"));
                });
                self.set_learning(&tab, true).await;
            }
            Err(e) => {
                self.fail(format!("Could not open a tab for teaching: {e}")).await;
            }
        }
    }

    /// 录制的动作立即按 (host, goal) 写入知识库；摘要在后台生成
    async fn stop_teaching(&mut self) {
        let Some(task) = self.store.get() else {
            tracing::debug!("STOP_TEACHING without a task");
            return;
        };
        if task.status != TaskStatus::Teaching || task.summarizing {
            tracing::debug!(status = %task.status, "STOP_TEACHING ignored");
            return;
        }
        let tab = task.active_handle().cloned();
        if let Some(tab) = tab {
            self.collect_recording(&tab).await;
        }
        let Some(task) = self.store.get() else {
            return;
        };
        let generation = task.generation;
        let goal = task.goal.clone();
        let actions = task.recorded_actions.clone();

        let host = actions
            .iter()
            .find_map(RecordedAction::host)
            .unwrap_or_else(|| "unknown".to_string());
        self.knowledge.learn(&host, &goal, actions.clone());
        self.persist_knowledge().await;
        self.store.mutate(|t| {
            t.summarizing = true;
            t.log(format!("Recorded {} actions on {host}.", actions.len()));
        });

        let teacher = self.roles.teacher.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let summary = teacher
                .summarize(&goal, &actions)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Event::internal(
                generation,
                Internal::TeachingSummarized { summary },
            ));
        });
    }

    fn on_teaching_summary(&mut self, summary: Result<String, String>) {
        if self.status() != Some(TaskStatus::Teaching) {
            tracing::debug!("teaching summary arrived outside teaching, ignored");
            return;
        }
        self.store.mutate(|t| {
            let text = match summary {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "teaching summary failed");
                    format!(
                        "Learned {} actions for \"{}\".",
                        t.recorded_actions.len(),
                        t.goal
                    )
                }
            };
            t.log(format!("Lesson: {text}"));
            t.final_answer = Some(text);
            t.summarizing = false;
        });
        self.transition(TaskStatus::Completed);
    }

    // ---- 凭据 ----

    async fn unlock_vault(&mut self, passphrase: &str) -> Next {
        if let Err(e) = self.vault.unlock(passphrase).await {
            tracing::warn!(error = %e, "vault unlock failed");
            self.log(format!("Vault unlock failed: {e}"));
            return None;
        }
        tracing::info!("vault unlocked");
        if self.status() != Some(TaskStatus::AwaitingPassphrase) {
            return None;
        }
        self.log("Vault unlocked.");
        let needs_plan = self.store.get().is_some_and(|t| t.plan.is_empty());
        if needs_plan {
            self.after_research().await
        } else {
            self.transition(TaskStatus::Thinking);
            self.next(Internal::AdvanceTurn)
        }
    }

    /// 用户为待命名的凭据值取名：交给凭据库保存，scratchpad 里只留占位引用
    async fn save_credential(&mut self, name: &str) -> Next {
        if self.status() != Some(TaskStatus::AwaitingCredentialName) {
            tracing::debug!("SAVE_CREDENTIAL ignored, nothing pending");
            return None;
        }
        let name = name.trim();
        let Some(value) = self.pending_credential.as_deref() else {
            tracing::warn!("awaiting a credential name but the pending slot is empty");
            return None;
        };
        if name.is_empty() {
            return None;
        }
        if let Err(e) = self.vault.store(name, value).await {
            tracing::warn!(error = %e, "storing credential failed");
            self.log(format!("Could not save the credential: {e}. Unlock the vault and save again."));
            return None;
        }
        self.pending_credential = None;
        self.step_succeeded(format!("Saved credential as {{{{credential:{name}}}}}."))
    }
}

/// 按配置组装编排器并在后台运行；返回命令发送端、最新快照接收端、通知接收端
pub async fn create_orchestrator(
    cfg: &AppConfig,
    gateway: Arc<dyn EnvironmentGateway>,
) -> anyhow::Result<(
    mpsc::UnboundedSender<Command>,
    watch::Receiver<Option<TaskSnapshot>>,
    broadcast::Receiver<TaskSnapshot>,
)> {
    let llm = create_llm_from_config(cfg)
        .context("No API key found; set DEEPSEEK_API_KEY or OPENAI_API_KEY")?;
    let client = Arc::new(DecisionClient::from_config(llm, &cfg.llm));

    let data_dir = cfg
        .app
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("data"));
    let knowledge_path = cfg
        .knowledge
        .path
        .clone()
        .unwrap_or_else(|| data_dir.join("knowledge.json"));
    let knowledge = KnowledgeStore::load(&knowledge_path, &cfg.knowledge)
        .await
        .with_context(|| format!("Failed to load {}", knowledge_path.display()))?;

    let parts = Collaborators {
        roles: Roles::new(client, &cfg.orchestrator.debate),
        gateway,
        knowledge,
        vault: Arc::new(MemoryVault::new(cfg.vault.passphrase.clone())),
        companion: CompanionRelay::from_config(&cfg.companion),
    };
    let (orchestrator, internal_rx) = Orchestrator::new(cfg, parts);
    let state_rx = orchestrator.watch();
    let notify_rx = orchestrator.subscribe();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    tokio::spawn(orchestrator.run(cmd_rx, internal_rx));

    Ok((cmd_tx, state_rx, notify_rx))
}

/// 页面语义检索使用的嵌入后端（未启用时为 None）
pub fn semantic_index_from_config(cfg: &AppConfig) -> crate::env::SemanticIndex {
    let embedder = create_embedder_from_config(
        cfg.embedding.enabled,
        cfg.llm.base_url.as_deref(),
        &cfg.embedding.model,
    );
    crate::env::SemanticIndex::new(embedder)
}
