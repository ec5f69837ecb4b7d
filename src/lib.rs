//! Courier - 自主浏览器任务编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 事件驱动状态机、任务存储、错误恢复、延迟恢复监管、伴随设备推送
//! - **env**: 环境网关抽象（Headless Chrome / Mock）与页面语义检索
//! - **knowledge**: 历史任务与学习到的站点工具（JSON 持久化）
//! - **llm**: 决策服务客户端（OpenAI 兼容 / Mock）、重试与 JSON 修复
//! - **observability**: tracing 初始化
//! - **roles**: Triage / Researcher / Planner / Manager / Verifier / Presenter / Teacher / Debate
//! - **vault**: 凭据库协作方

pub mod config;
pub mod core;
pub mod env;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod roles;
pub mod vault;
