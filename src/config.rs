//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COURIER__*` 覆盖（双下划线表示嵌套，如 `COURIER__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub knowledge: KnowledgeSection,
    pub vault: VaultSection,
    pub companion: CompanionSection,
    pub embedding: EmbeddingSection,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 数据目录，未设置时用 ./data
    pub data_dir: Option<PathBuf>,
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次调用超时（秒），超时按瞬时错误重试
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
            retry: RetrySection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

/// [llm.retry] 段：指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_true() -> bool {
    true
}

/// [orchestrator] 段：状态机阈值、超时与上限
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 连续步骤失败达到此数时触发重规划
    #[serde(default = "default_step_failure_threshold")]
    pub step_failure_threshold: u32,
    /// 某站点失败达到此数后不再出现在新计划中
    #[serde(default = "default_host_failure_threshold")]
    pub host_failure_threshold: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// 页面观察硬超时（秒）
    #[serde(default = "default_observation_timeout")]
    pub observation_timeout_secs: u64,
    /// LONG_WAIT 固定等待时长（毫秒）
    #[serde(default = "default_long_wait_ms")]
    pub long_wait_ms: u64,
    #[serde(default = "default_start_url")]
    pub start_url: String,
    /// 无需 Verifier 审核即可导航的域名
    #[serde(default)]
    pub trusted_hosts: Vec<String>,
    /// 传给 Manager / Planner 的 scratchpad 尾部条数
    #[serde(default = "default_scratchpad_tail")]
    pub scratchpad_tail: usize,
    #[serde(default)]
    pub snapshot: SnapshotSection,
    #[serde(default)]
    pub debate: DebateSection,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            step_failure_threshold: default_step_failure_threshold(),
            host_failure_threshold: default_host_failure_threshold(),
            max_turns: default_max_turns(),
            max_replans: default_max_replans(),
            observation_timeout_secs: default_observation_timeout(),
            long_wait_ms: default_long_wait_ms(),
            start_url: default_start_url(),
            trusted_hosts: Vec::new(),
            scratchpad_tail: default_scratchpad_tail(),
            snapshot: SnapshotSection::default(),
            debate: DebateSection::default(),
        }
    }
}

impl OrchestratorSection {
    pub fn observation_timeout(&self) -> Duration {
        Duration::from_secs(self.observation_timeout_secs)
    }

    pub fn long_wait(&self) -> Duration {
        Duration::from_millis(self.long_wait_ms)
    }
}

fn default_step_failure_threshold() -> u32 {
    3
}

fn default_host_failure_threshold() -> u32 {
    3
}

fn default_max_turns() -> u32 {
    40
}

fn default_max_replans() -> u32 {
    5
}

fn default_observation_timeout() -> u64 {
    20
}

fn default_long_wait_ms() -> u64 {
    30_000
}

fn default_start_url() -> String {
    "https://duckduckgo.com".to_string()
}

fn default_scratchpad_tail() -> usize {
    12
}

/// [orchestrator.snapshot] 段：观察结果截断，控制 prompt 体积
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotSection {
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            max_content_chars: default_max_content_chars(),
            max_elements: default_max_elements(),
            max_images: default_max_images(),
        }
    }
}

fn default_max_content_chars() -> usize {
    6000
}

fn default_max_elements() -> usize {
    80
}

fn default_max_images() -> usize {
    10
}

/// [orchestrator.debate] 段：专家辩论
#[derive(Debug, Clone, Deserialize)]
pub struct DebateSection {
    #[serde(default = "default_persona_count")]
    pub persona_count: usize,
    /// 同一阶段内并发的 persona 调用数
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

impl Default for DebateSection {
    fn default() -> Self {
        Self {
            persona_count: default_persona_count(),
            fan_out: default_fan_out(),
        }
    }
}

fn default_persona_count() -> usize {
    3
}

fn default_fan_out() -> usize {
    3
}

/// [knowledge] 段：历史与学习工具的持久化
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeSection {
    /// JSON 文件路径，未设置时为 <data_dir>/knowledge.json
    pub path: Option<PathBuf>,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(default = "default_completed_cap")]
    pub completed_cap: usize,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            path: None,
            history_cap: default_history_cap(),
            completed_cap: default_completed_cap(),
        }
    }
}

fn default_history_cap() -> usize {
    50
}

fn default_completed_cap() -> usize {
    20
}

/// [vault] 段：内存凭据库口令（未设置时首次解锁的口令即为口令）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct VaultSection {
    pub passphrase: Option<String>,
}

/// [companion] 段：伴随设备状态推送
#[derive(Debug, Clone, Deserialize)]
pub struct CompanionSection {
    /// 例如 http://127.0.0.1:8765/status；未设置时不推送
    pub endpoint: Option<String>,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_push_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CompanionSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            cooldown_secs: default_cooldown_secs(),
            timeout_ms: default_push_timeout_ms(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_push_timeout_ms() -> u64 {
    1500
}

/// [embedding] 段：页面语义检索
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_embedding_model(),
            top_k: default_top_k(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_top_k() -> usize {
    5
}

/// 从 config 目录加载配置，环境变量 COURIER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COURIER__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COURIER")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_escalation_rules() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.step_failure_threshold, 3);
        assert_eq!(cfg.orchestrator.host_failure_threshold, 3);
        assert_eq!(cfg.llm.retry.max_attempts, 3);
        assert!(cfg.companion.endpoint.is_none());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(
            &path,
            "[orchestrator]\nmax_turns = 7\ntrusted_hosts = [\"example.com\"]\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_turns, 7);
        assert_eq!(cfg.orchestrator.trusted_hosts, vec!["example.com".to_string()]);
        assert_eq!(cfg.orchestrator.long_wait_ms, 30_000);
    }
}
