//! Manager 决策的 JSON Schema（schemars 自动生成）
//!
//! 拼进 Manager 的 system prompt，减少模型输出格式错误。

use schemars::schema_for;

use crate::roles::action::ManagerDecision;

pub fn manager_decision_schema_json() -> String {
    let schema = schema_for!(ManagerDecision);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
