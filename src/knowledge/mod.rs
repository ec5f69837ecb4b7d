//! 知识库：学习到的工具、任务历史、已完成任务记录
//!
//! 单个 JSON 文件（knowledge.json）持久化；所有字段 `#[serde(default)]`，
//! 新增字段无需迁移。编排器顺序访问，只追加 / 合并。

pub mod history;
pub mod learned;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::KnowledgeSection;
use crate::env::RecordedAction;

pub use history::{CompletedTask, HistoryEntry};
pub use learned::LearnedTool;

/// 落盘格式
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeData {
    pub history: Vec<HistoryEntry>,
    pub completed: Vec<CompletedTask>,
    /// host -> 任务描述 -> 录制的原语动作序列
    pub learned_tools: BTreeMap<String, BTreeMap<String, Vec<RecordedAction>>>,
}

pub struct KnowledgeStore {
    path: Option<PathBuf>,
    data: KnowledgeData,
    history_cap: usize,
    completed_cap: usize,
}

impl KnowledgeStore {
    /// 仅内存，不落盘（测试 / 临时会话）
    pub fn in_memory(cfg: &KnowledgeSection) -> Self {
        Self {
            path: None,
            data: KnowledgeData::default(),
            history_cap: cfg.history_cap,
            completed_cap: cfg.completed_cap,
        }
    }

    /// 从 JSON 文件加载；文件不存在时为空库
    pub async fn load(path: impl AsRef<Path>, cfg: &KnowledgeSection) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => KnowledgeData::default(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Ok(Self {
            path: Some(path),
            data,
            history_cap: cfg.history_cap,
            completed_cap: cfg.completed_cap,
        })
    }

    /// 写回 JSON 文件；父目录不存在时自动创建。先写临时文件再 rename，中途失败不留半个文件
    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.data)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    pub fn data(&self) -> &KnowledgeData {
        &self.data
    }
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
pub(crate) fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric() && c != '.' && c != '-')
        .map(|w| w.trim_matches(|c| c == '.' || c == '-').to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}
