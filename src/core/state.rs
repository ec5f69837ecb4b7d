//! 任务状态定义：Task 记录与 TaskSnapshot 投影
//!
//! Task 只由编排器修改；UI / 伴随设备只看到 TaskSnapshot（不含待命名的凭据值）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::env::{RecordedAction, TabHandle};

/// 任务状态机的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Researching,
    Planning,
    Thinking,
    Verifying,
    Executing,
    Waiting,
    Replanning,
    Teaching,
    UserInputPending,
    AwaitingCredentialName,
    AwaitingPassphrase,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// 挂起等待用户（接管、教学、凭据命名、口令）
    pub fn awaits_user(self) -> bool {
        matches!(
            self,
            Self::UserInputPending
                | Self::Teaching
                | Self::AwaitingCredentialName
                | Self::AwaitingPassphrase
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&s)
    }
}

fn default_true() -> bool {
    true
}

/// 规划前收集的事实与 Researcher 的路由判断
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchData {
    #[serde(default)]
    pub facts: Vec<String>,
    /// 是否需要在浏览器里执行动作
    #[serde(default = "default_true")]
    pub requires_browser: bool,
    /// 是否需要用到凭据库中已保存的凭据
    #[serde(default)]
    pub needs_credentials: bool,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Default for ResearchData {
    fn default() -> Self {
        Self {
            facts: Vec::new(),
            requires_browser: true,
            needs_credentials: false,
            summary: None,
        }
    }
}

/// 当前任务的完整记录
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: String,
    pub generation: u64,
    pub goal: String,
    pub status: TaskStatus,
    pub plan: Vec<String>,
    pub current_step: usize,
    pub turn: u32,
    /// 只追加的叙述日志，Presenter 唯一信任的输入
    pub scratchpad: Vec<String>,
    pub research: ResearchData,
    pub step_failure_count: u32,
    /// host -> 失败次数，任务期间不清零
    pub website_failures: BTreeMap<String, u32>,
    pub tabs: BTreeMap<String, TabHandle>,
    pub active_tab: Option<String>,
    pub is_training: bool,
    pub is_deliberate_plan: bool,
    pub is_partial_success: bool,
    pub final_answer: Option<String>,
    pub call_to_action: Option<String>,
    pub failure_reason: Option<String>,
    /// LONG_WAIT 恢复时刻
    pub pending_wait: Option<DateTime<Utc>>,
    pub replan_count: u32,
    pub recorded_actions: Vec<RecordedAction>,
    /// 辩论得出、尚未执行的计划（ATTEMPT_STRATEGY 时交给回合循环）
    pub debate_plan: Vec<String>,
    /// STOP_TEACHING 后等待摘要
    pub summarizing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>, generation: u64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            generation,
            goal: goal.into(),
            status: TaskStatus::Researching,
            plan: Vec::new(),
            current_step: 0,
            turn: 0,
            scratchpad: Vec::new(),
            research: ResearchData::default(),
            step_failure_count: 0,
            website_failures: BTreeMap::new(),
            tabs: BTreeMap::new(),
            active_tab: None,
            is_training: false,
            is_deliberate_plan: false,
            is_partial_success: false,
            final_answer: None,
            call_to_action: None,
            failure_reason: None,
            pending_wait: None,
            replan_count: 0,
            recorded_actions: Vec::new(),
            debate_plan: Vec::new(),
            summarizing: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 追加一条 scratchpad 记录
    pub fn log(&mut self, entry: impl Into<String>) {
        self.scratchpad.push(entry.into());
        self.touch();
    }

    pub fn scratchpad_tail(&self, n: usize) -> &[String] {
        let start = self.scratchpad.len().saturating_sub(n);
        &self.scratchpad[start..]
    }

    pub fn current_step_text(&self) -> Option<&str> {
        self.plan.get(self.current_step).map(String::as_str)
    }

    /// 步骤成功：前进一步（不超过最后一步），清零连续失败计数
    pub fn advance_step(&mut self) {
        if !self.plan.is_empty() {
            self.current_step = (self.current_step + 1).min(self.plan.len() - 1);
        }
        self.step_failure_count = 0;
        self.touch();
    }

    /// 换上新计划：步骤与连续失败计数归零
    pub fn replace_plan(&mut self, plan: Vec<String>) {
        self.plan = plan;
        self.current_step = 0;
        self.step_failure_count = 0;
        self.touch();
    }

    /// 记一次站点失败，返回该站点累计次数
    pub fn record_host_failure(&mut self, host: &str) -> u32 {
        let count = self.website_failures.entry(host.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// 失败次数达到阈值、不得再出现在新计划里的站点
    pub fn excluded_hosts(&self, threshold: u32) -> Vec<String> {
        self.website_failures
            .iter()
            .filter(|(_, &n)| n >= threshold)
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn active_handle(&self) -> Option<&TabHandle> {
        self.active_tab.as_ref().and_then(|name| self.tabs.get(name))
    }
}

/// 广播给 UI / 伴随设备的任务投影
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub generation: u64,
    pub goal: String,
    pub status: TaskStatus,
    pub plan: Vec<String>,
    pub current_step: usize,
    pub turn: u32,
    pub scratchpad: Vec<String>,
    pub tabs: Vec<String>,
    pub active_tab: Option<String>,
    pub is_training: bool,
    pub is_deliberate_plan: bool,
    pub is_partial_success: bool,
    pub final_answer: Option<String>,
    pub call_to_action: Option<String>,
    pub failure_reason: Option<String>,
    pub pending_wait: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            generation: task.generation,
            goal: task.goal.clone(),
            status: task.status,
            plan: task.plan.clone(),
            current_step: task.current_step,
            turn: task.turn,
            scratchpad: task.scratchpad.clone(),
            tabs: task.tabs.keys().cloned().collect(),
            active_tab: task.active_tab.clone(),
            is_training: task.is_training,
            is_deliberate_plan: task.is_deliberate_plan,
            is_partial_success: task.is_partial_success,
            final_answer: task.final_answer.clone(),
            call_to_action: task.call_to_action.clone(),
            failure_reason: task.failure_reason.clone(),
            pending_wait: task.pending_wait,
            updated_at: task.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_step_is_capped() {
        let mut task = Task::new("goal", 1);
        task.replace_plan(vec!["a".into(), "b".into()]);
        task.step_failure_count = 2;
        task.advance_step();
        assert_eq!(task.current_step, 1);
        assert_eq!(task.step_failure_count, 0);
        task.advance_step();
        assert_eq!(task.current_step, 1);
    }

    #[test]
    fn test_excluded_hosts_threshold() {
        let mut task = Task::new("goal", 1);
        task.record_host_failure("shop.example.com");
        task.record_host_failure("shop.example.com");
        assert!(task.excluded_hosts(3).is_empty());
        assert_eq!(task.record_host_failure("shop.example.com"), 3);
        assert_eq!(task.excluded_hosts(3), vec!["shop.example.com".to_string()]);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(TaskStatus::AwaitingCredentialName.to_string(), "AWAITING_CREDENTIAL_NAME");
        assert!(TaskStatus::Stopped.is_terminal());
        assert!(TaskStatus::Teaching.awaits_user());
        assert!(!TaskStatus::Waiting.awaits_user());
    }

    #[test]
    fn test_research_defaults_to_browser_needed() {
        let r: ResearchData = serde_json::from_str(r#"{"facts": ["x"]}"#).unwrap();
        assert!(r.requires_browser);
        assert!(!r.needs_credentials);
    }
}
