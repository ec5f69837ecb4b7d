//! 脚本化环境网关（测试与无浏览器运行时使用）
//!
//! 页面按 URL 预置；动作结果可按顺序预置失败，未预置时一律成功。
//! 所有调用都会被记录，便于断言编排器下发了什么。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::env::{
    ActionOutcome, ActionSpec, EnvError, EnvironmentGateway, PageSnapshot, PrimitiveKind,
    RecordedAction, SemanticIndex, TabHandle,
};

#[derive(Default)]
struct MockState {
    tabs: HashMap<TabHandle, String>,
    active: Option<TabHandle>,
    next_tab: usize,
    executed: Vec<(TabHandle, ActionSpec)>,
    outcomes: VecDeque<Result<ActionOutcome, EnvError>>,
    learning: Vec<(TabHandle, bool)>,
    recording: Vec<RecordedAction>,
}

#[derive(Default)]
pub struct MockGateway {
    pages: HashMap<String, PageSnapshot>,
    snapshot_delay: Option<Duration>,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置页面；create_tab / Navigate 到该 URL 后 snapshot 返回它
    pub fn with_page(mut self, page: PageSnapshot) -> Self {
        self.pages.insert(page.url.clone(), page);
        self
    }

    /// 让每次 snapshot 先睡眠，用于触发观察超时
    pub fn with_snapshot_delay(mut self, delay: Duration) -> Self {
        self.snapshot_delay = Some(delay);
        self
    }

    /// 预置下一次 execute 的结果
    pub fn push_outcome(&self, outcome: Result<ActionOutcome, EnvError>) {
        if let Ok(mut state) = self.state.lock() {
            state.outcomes.push_back(outcome);
        }
    }

    pub fn fail_next(self, err: EnvError) -> Self {
        self.push_outcome(Err(err));
        self
    }

    /// 预置页面内录到的用户动作；下一次关闭录制时交还
    pub fn push_recorded(&self, action: RecordedAction) {
        if let Ok(mut state) = self.state.lock() {
            state.recording.push(action);
        }
    }

    pub fn executed(&self) -> Vec<(TabHandle, ActionSpec)> {
        self.state.lock().map(|s| s.executed.clone()).unwrap_or_default()
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().map(|s| s.tabs.len()).unwrap_or_default()
    }

    pub fn learning_toggles(&self) -> Vec<(TabHandle, bool)> {
        self.state.lock().map(|s| s.learning.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, EnvError> {
        self.state.lock().map_err(|e| EnvError::Browser(e.to_string()))
    }

    fn page_for(&self, url: &str) -> PageSnapshot {
        self.pages.get(url).cloned().unwrap_or_else(|| PageSnapshot {
            url: url.to_string(),
            title: url.to_string(),
            ..PageSnapshot::default()
        })
    }
}

#[async_trait]
impl EnvironmentGateway for MockGateway {
    async fn snapshot(&self, tab: &TabHandle) -> Result<PageSnapshot, EnvError> {
        if let Some(delay) = self.snapshot_delay {
            tokio::time::sleep(delay).await;
        }
        let url = self
            .lock()?
            .tabs
            .get(tab)
            .cloned()
            .ok_or_else(|| EnvError::NoSuchTab(tab.to_string()))?;
        Ok(self.page_for(&url))
    }

    async fn execute(&self, tab: &TabHandle, spec: &ActionSpec) -> Result<ActionOutcome, EnvError> {
        let mut state = self.lock()?;
        if !state.tabs.contains_key(tab) {
            return Err(EnvError::NoSuchTab(tab.to_string()));
        }
        state.executed.push((tab.clone(), spec.clone()));
        if let Some(outcome) = state.outcomes.pop_front() {
            return outcome;
        }
        if spec.action == PrimitiveKind::Navigate {
            let url = spec
                .url
                .clone()
                .ok_or_else(|| EnvError::Navigation("missing url".into()))?;
            state.tabs.insert(tab.clone(), url.clone());
            return Ok(ActionOutcome {
                message: format!("navigated to {url}"),
                url: Some(url),
            });
        }
        Ok(ActionOutcome {
            message: format!("{} ok", spec.describe()),
            url: state.tabs.get(tab).cloned(),
        })
    }

    async fn create_tab(&self, url: &str) -> Result<TabHandle, EnvError> {
        let mut state = self.lock()?;
        state.next_tab += 1;
        let handle = TabHandle(format!("tab-{}", state.next_tab));
        state.tabs.insert(handle.clone(), url.to_string());
        state.active = Some(handle.clone());
        Ok(handle)
    }

    async fn switch_tab(&self, tab: &TabHandle) -> Result<(), EnvError> {
        let mut state = self.lock()?;
        if !state.tabs.contains_key(tab) {
            return Err(EnvError::NoSuchTab(tab.to_string()));
        }
        state.active = Some(tab.clone());
        Ok(())
    }

    async fn wait_for_load(&self, tab: &TabHandle) -> Result<(), EnvError> {
        if self.lock()?.tabs.contains_key(tab) {
            Ok(())
        } else {
            Err(EnvError::NoSuchTab(tab.to_string()))
        }
    }

    async fn semantic_search(
        &self,
        tab: &TabHandle,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, EnvError> {
        let page = self.snapshot(tab).await?;
        Ok(SemanticIndex::new(None)
            .search(&page.main_content, query, k)
            .await)
    }

    async fn set_learning(
        &self,
        tab: &TabHandle,
        enabled: bool,
    ) -> Result<Vec<RecordedAction>, EnvError> {
        let mut state = self.lock()?;
        state.learning.push((tab.clone(), enabled));
        if enabled {
            return Ok(Vec::new());
        }
        Ok(std::mem::take(&mut state.recording))
    }
}
