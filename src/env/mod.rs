//! 环境网关：浏览器自动化宿主的抽象
//!
//! 编排器只通过 EnvironmentGateway 观察页面、执行原语动作、管理多标签页；
//! 所有调用都是异步且可失败的。具体实现：
//! - `chrome`：Headless Chrome（需 feature "browser"）
//! - `mock`：脚本化网关，用于测试与离线运行

#[cfg(feature = "browser")]
pub mod chrome;
pub mod mock;
pub mod semantic;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SnapshotSection;

#[cfg(feature = "browser")]
pub use chrome::ChromeGateway;
pub use mock::MockGateway;
pub use semantic::SemanticIndex;

/// 环境侧的标签页句柄
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabHandle(pub String);

impl std::fmt::Display for TabHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 网关错误（均为非致命，由编排器计入步骤失败）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("No such tab: {0}")]
    NoSuchTab(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Browser error: {0}")]
    Browser(String),
}

/// 页面上的可交互元素
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractiveElement {
    pub selector: String,
    pub role: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageImage {
    pub src: String,
    pub alt: String,
}

/// 一次页面观察结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub main_content: String,
    pub interactive_elements: Vec<InteractiveElement>,
    pub images: Vec<PageImage>,
}

impl PageSnapshot {
    pub fn host(&self) -> Option<String> {
        host_of(&self.url)
    }

    /// 按配置截断正文与元素列表，控制 prompt 体积
    pub fn truncated(mut self, limits: &SnapshotSection) -> Self {
        if self.main_content.chars().count() > limits.max_content_chars {
            self.main_content = self
                .main_content
                .chars()
                .take(limits.max_content_chars)
                .collect::<String>()
                + "\n...[truncated]";
        }
        self.interactive_elements.truncate(limits.max_elements);
        self.images.truncate(limits.max_images);
        self
    }

    /// 渲染为 Manager prompt 中的页面段落
    pub fn to_prompt(&self) -> String {
        let mut s = format!("# {}\nURL: {}\n\n", self.title, self.url);
        if !self.interactive_elements.is_empty() {
            s.push_str("## Interactive elements\n");
            for el in &self.interactive_elements {
                s.push_str(&format!("- {} `{}`: \"{}\"\n", el.role, el.selector, el.name));
            }
            s.push('\n');
        }
        if !self.images.is_empty() {
            s.push_str("## Images\n");
            for img in &self.images {
                s.push_str(&format!("- {} ({})\n", img.alt, img.src));
            }
            s.push('\n');
        }
        s.push_str("## Content\n");
        s.push_str(&self.main_content);
        s
    }
}

/// 原语动作类型（环境协议里的 `action` 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimitiveKind {
    Navigate,
    Click,
    Type,
    Submit,
    Scroll,
}

/// 动作下发请求：`{action, selector?, text?, url?, tabName?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub action: PrimitiveKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_name: Option<String>,
}

impl ActionSpec {
    pub fn new(action: PrimitiveKind) -> Self {
        Self {
            action,
            selector: None,
            text: None,
            url: None,
            tab_name: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// 日志 / scratchpad 用的一行描述
    pub fn describe(&self) -> String {
        let mut s = format!("{:?}", self.action).to_uppercase();
        if let Some(sel) = &self.selector {
            s.push_str(&format!(" {sel}"));
        }
        if let Some(url) = &self.url {
            s.push_str(&format!(" {url}"));
        }
        if let Some(text) = &self.text {
            s.push_str(&format!(" \"{text}\""));
        }
        s
    }
}

/// 动作执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub message: String,
    /// 动作之后页面所在的 URL（若网关可知）
    pub url: Option<String>,
}

/// 用户在接管 / 教学时手动执行、被录制下来的原语动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedAction {
    #[serde(flatten)]
    pub spec: ActionSpec,
    /// 动作发生时的页面 URL
    pub page_url: String,
    #[serde(default)]
    pub recorded_at: i64,
}

impl RecordedAction {
    pub fn host(&self) -> Option<String> {
        host_of(&self.page_url)
    }
}

/// 从 URL 提取域名（小写，去掉端口与 www. 前缀）
pub fn host_of(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split(':').next()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    (host.contains('.') && !host.contains(' ')).then_some(host)
}

/// 浏览器自动化宿主
#[async_trait]
pub trait EnvironmentGateway: Send + Sync {
    async fn snapshot(&self, tab: &TabHandle) -> Result<PageSnapshot, EnvError>;

    async fn execute(&self, tab: &TabHandle, spec: &ActionSpec) -> Result<ActionOutcome, EnvError>;

    async fn create_tab(&self, url: &str) -> Result<TabHandle, EnvError>;

    async fn switch_tab(&self, tab: &TabHandle) -> Result<(), EnvError>;

    async fn wait_for_load(&self, tab: &TabHandle) -> Result<(), EnvError>;

    /// 返回与 query 最相关的 top-k 文本片段
    async fn semantic_search(
        &self,
        tab: &TabHandle,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, EnvError>;

    /// 开关页面内的用户动作录制。关闭时返回自上次开启以来录下的动作
    async fn set_learning(
        &self,
        tab: &TabHandle,
        enabled: bool,
    ) -> Result<Vec<RecordedAction>, EnvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://www.Example.com:8080/a?b"), Some("example.com".into()));
        assert_eq!(host_of("http://shop.example.org"), Some("shop.example.org".into()));
        assert_eq!(host_of("example.net/path"), Some("example.net".into()));
        assert_eq!(host_of("about:blank"), None);
        assert_eq!(host_of(""), None);
    }

    #[test]
    fn test_snapshot_truncation() {
        let snap = PageSnapshot {
            url: "https://example.com".into(),
            title: "Example".into(),
            main_content: "x".repeat(100),
            interactive_elements: (0..10)
                .map(|i| InteractiveElement {
                    selector: format!("#b{i}"),
                    role: "button".into(),
                    name: format!("B{i}"),
                })
                .collect(),
            images: vec![],
        };
        let limits = SnapshotSection {
            max_content_chars: 10,
            max_elements: 3,
            max_images: 1,
        };
        let t = snap.truncated(&limits);
        assert!(t.main_content.starts_with("xxxxxxxxxx\n...[truncated]"));
        assert_eq!(t.interactive_elements.len(), 3);
    }

    #[test]
    fn test_action_spec_wire_format() {
        let spec = ActionSpec::new(PrimitiveKind::Type)
            .with_selector("#q")
            .with_text("rust");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["action"], "TYPE");
        assert_eq!(json["selector"], "#q");
        assert!(json.get("url").is_none());
    }
}
