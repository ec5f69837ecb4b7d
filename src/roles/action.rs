//! Manager 可下发的动作：封闭的 tagged enum，按 `action` 字段区分
//!
//! 新增动作类型必须在编排器的 dispatch 中穷尽匹配。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::env::{ActionSpec, PrimitiveKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// 在当前（或指定）标签页打开 URL
    Navigate {
        url: String,
        #[serde(default, rename = "tabName", skip_serializing_if = "Option::is_none")]
        tab_name: Option<String>,
    },
    Click {
        selector: String,
        #[serde(default, rename = "tabName", skip_serializing_if = "Option::is_none")]
        tab_name: Option<String>,
    },
    /// text 中可用 `{{credential:NAME}}` 引用已保存的凭据
    Type {
        selector: String,
        text: String,
        #[serde(default, rename = "tabName", skip_serializing_if = "Option::is_none")]
        tab_name: Option<String>,
    },
    Submit {
        selector: String,
    },
    Scroll {
        direction: ScrollDirection,
    },
    /// 新开一个命名标签页并切换过去
    OpenTab {
        #[serde(rename = "tabName")]
        tab_name: String,
        url: String,
    },
    SwitchTab {
        #[serde(rename = "tabName")]
        tab_name: String,
    },
    /// 在当前页面正文中做语义检索
    Search {
        query: String,
    },
    /// 把已发现的事实记入 scratchpad
    Record {
        note: String,
    },
    /// 等待较长时间（如排队、邮件送达）后再观察
    LongWait,
    /// 页面上生成 / 显示了需要保存的凭据值
    SaveCredentialValue {
        value: String,
    },
    Answer {
        text: String,
    },
    PartialSuccess {
        reason: String,
    },
    Fail {
        reason: String,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "NAVIGATE",
            Action::Click { .. } => "CLICK",
            Action::Type { .. } => "TYPE",
            Action::Submit { .. } => "SUBMIT",
            Action::Scroll { .. } => "SCROLL",
            Action::OpenTab { .. } => "OPEN_TAB",
            Action::SwitchTab { .. } => "SWITCH_TAB",
            Action::Search { .. } => "SEARCH",
            Action::Record { .. } => "RECORD",
            Action::LongWait => "LONG_WAIT",
            Action::SaveCredentialValue { .. } => "SAVE_CREDENTIAL_VALUE",
            Action::Answer { .. } => "ANSWER",
            Action::PartialSuccess { .. } => "PARTIAL_SUCCESS",
            Action::Fail { .. } => "FAIL",
        }
    }

    /// 导航类动作的目的地；由安全策略决定是否需要 Verifier 审核
    pub fn target_url(&self) -> Option<&str> {
        match self {
            Action::Navigate { url, .. } | Action::OpenTab { url, .. } => Some(url),
            _ => None,
        }
    }

    /// 动作指定的标签页
    pub fn tab_name(&self) -> Option<&str> {
        match self {
            Action::Navigate { tab_name, .. }
            | Action::Click { tab_name, .. }
            | Action::Type { tab_name, .. } => tab_name.as_deref(),
            Action::OpenTab { tab_name, .. } | Action::SwitchTab { tab_name } => Some(tab_name),
            _ => None,
        }
    }

    /// 可直接交给环境网关的原语动作
    pub fn to_spec(&self) -> Option<ActionSpec> {
        let spec = match self {
            Action::Navigate { url, tab_name } => ActionSpec {
                tab_name: tab_name.clone(),
                ..ActionSpec::new(PrimitiveKind::Navigate).with_url(url.clone())
            },
            Action::Click { selector, tab_name } => ActionSpec {
                tab_name: tab_name.clone(),
                ..ActionSpec::new(PrimitiveKind::Click).with_selector(selector.clone())
            },
            Action::Type {
                selector,
                text,
                tab_name,
            } => ActionSpec {
                tab_name: tab_name.clone(),
                ..ActionSpec::new(PrimitiveKind::Type)
                    .with_selector(selector.clone())
                    .with_text(text.clone())
            },
            Action::Submit { selector } => {
                ActionSpec::new(PrimitiveKind::Submit).with_selector(selector.clone())
            }
            Action::Scroll { direction } => ActionSpec::new(PrimitiveKind::Scroll).with_text(
                match direction {
                    ScrollDirection::Up => "up",
                    ScrollDirection::Down => "down",
                },
            ),
            _ => return None,
        };
        Some(spec)
    }

    /// scratchpad 用的一行描述；凭据值不落入日志
    pub fn describe(&self) -> String {
        match self {
            Action::SaveCredentialValue { .. } => "SAVE_CREDENTIAL_VALUE [redacted]".to_string(),
            Action::OpenTab { tab_name, url } => format!("OPEN_TAB {tab_name} {url}"),
            Action::SwitchTab { tab_name } => format!("SWITCH_TAB {tab_name}"),
            Action::Search { query } => format!("SEARCH \"{query}\""),
            Action::Record { note } => format!("RECORD {note}"),
            Action::Answer { .. } | Action::PartialSuccess { .. } | Action::Fail { .. } => {
                self.kind().to_string()
            }
            Action::LongWait => self.kind().to_string(),
            _ => self
                .to_spec()
                .map(|s| s.describe())
                .unwrap_or_else(|| self.kind().to_string()),
        }
    }
}

/// Manager 一次决策：思考 + 动作（动作字段平铺在同一层）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ManagerDecision {
    #[serde(default)]
    pub thought: String,
    #[serde(flatten)]
    pub action: Action,
}
