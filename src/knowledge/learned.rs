//! 学习到的工具：host -> 任务描述 -> 录制的动作序列
//!
//! 只追加；每个回合前按关键词重叠匹配当前步骤。

use crate::env::RecordedAction;
use crate::knowledge::{tokenize_lower, KnowledgeStore};

/// 最低重叠比例（相对工具描述的词数）
const MATCH_RATIO: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedTool {
    pub host: String,
    pub description: String,
    pub actions: Vec<RecordedAction>,
}

impl LearnedTool {
    pub fn to_prompt(&self) -> String {
        let steps: Vec<String> = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| format!("{}. {}", i + 1, a.spec.describe()))
            .collect();
        format!(
            "Learned tool for {} (\"{}\"):\n{}",
            self.host,
            self.description,
            steps.join("\n")
        )
    }
}

impl KnowledgeStore {
    /// 追加录制的动作到 (host, description)
    pub fn learn(&mut self, host: &str, description: &str, actions: Vec<RecordedAction>) {
        if actions.is_empty() {
            return;
        }
        self.data
            .learned_tools
            .entry(host.to_string())
            .or_default()
            .entry(description.to_string())
            .or_default()
            .extend(actions);
    }

    /// 在 host 下找与 query 最相近的工具；host 未知时搜索全部站点
    pub fn match_tool(&self, host: Option<&str>, query: &str) -> Option<LearnedTool> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return None;
        }

        let mut best: Option<(f64, LearnedTool)> = None;
        for (tool_host, tools) in &self.data.learned_tools {
            if host.is_some_and(|h| h != tool_host) {
                continue;
            }
            for (description, actions) in tools {
                let desc_tokens = tokenize_lower(description);
                if desc_tokens.is_empty() {
                    continue;
                }
                let overlap = query_tokens.intersection(&desc_tokens).count();
                let ratio = overlap as f64 / desc_tokens.len() as f64;
                if overlap == 0 || ratio < MATCH_RATIO {
                    continue;
                }
                if best.as_ref().map_or(true, |(score, _)| ratio > *score) {
                    best = Some((
                        ratio,
                        LearnedTool {
                            host: tool_host.clone(),
                            description: description.clone(),
                            actions: actions.clone(),
                        },
                    ));
                }
            }
        }
        best.map(|(_, tool)| tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnowledgeSection;
    use crate::env::{ActionSpec, PrimitiveKind};

    fn click(sel: &str) -> RecordedAction {
        RecordedAction {
            spec: ActionSpec::new(PrimitiveKind::Click).with_selector(sel),
            page_url: "https://shop.example.com/cart".into(),
            recorded_at: 0,
        }
    }

    #[test]
    fn test_learn_appends() {
        let mut ks = KnowledgeStore::in_memory(&KnowledgeSection::default());
        ks.learn("shop.example.com", "checkout cart", vec![click("#cart")]);
        ks.learn("shop.example.com", "checkout cart", vec![click("#pay")]);
        ks.learn("shop.example.com", "ignored", vec![]);
        let tools = &ks.data().learned_tools["shop.example.com"];
        assert_eq!(tools.len(), 1);
        assert_eq!(tools["checkout cart"].len(), 2);
    }

    #[test]
    fn test_match_tool_by_host_and_keywords() {
        let mut ks = KnowledgeStore::in_memory(&KnowledgeSection::default());
        ks.learn("shop.example.com", "checkout the cart", vec![click("#cart")]);

        let hit = ks
            .match_tool(Some("shop.example.com"), "Go to the cart and checkout")
            .unwrap();
        assert_eq!(hit.description, "checkout the cart");
        assert!(hit.to_prompt().contains("CLICK #cart"));

        assert!(ks.match_tool(Some("other.example.com"), "checkout the cart").is_none());
        assert!(ks.match_tool(Some("shop.example.com"), "read reviews").is_none());
        assert!(ks.match_tool(None, "checkout cart").is_some());
    }
}
