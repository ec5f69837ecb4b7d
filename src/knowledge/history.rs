//! 任务历史与已完成任务记录（最近优先、有上限）

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::TaskStatus;
use crate::knowledge::{tokenize_lower, KnowledgeStore};

/// 历史记录：按目标去重
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub goal: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub answer: Option<String>,
    /// 毫秒时间戳，同时作为删除时的键
    pub timestamp: i64,
}

/// 已完成任务：供规划时检索参考
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub goal: String,
    pub answer: String,
    pub timestamp: i64,
}

impl KnowledgeStore {
    /// 归档一个任务目标；同一目标只保留最新一条
    pub fn archive(&mut self, goal: &str, status: TaskStatus, answer: Option<String>) {
        let history = &mut self.data.history;
        history.retain(|h| h.goal != goal);
        history.insert(
            0,
            HistoryEntry {
                goal: goal.to_string(),
                status,
                answer,
                timestamp: Utc::now().timestamp_millis(),
            },
        );
        history.truncate(self.history_cap);
    }

    pub fn record_completed(&mut self, goal: &str, answer: &str) {
        let completed = &mut self.data.completed;
        completed.insert(
            0,
            CompletedTask {
                goal: goal.to_string(),
                answer: answer.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );
        completed.truncate(self.completed_cap);
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.data.history
    }

    pub fn completed(&self) -> &[CompletedTask] {
        &self.data.completed
    }

    /// 按时间戳删除历史记录，返回是否删除成功
    pub fn delete_history(&mut self, timestamp: i64) -> bool {
        let before = self.data.history.len();
        self.data.history.retain(|h| h.timestamp != timestamp);
        self.data.history.len() != before
    }

    /// 与目标词重叠最多的 k 条已完成任务
    pub fn related_completed(&self, goal: &str, k: usize) -> Vec<CompletedTask> {
        let query = tokenize_lower(goal);
        if query.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, &CompletedTask)> = self
            .data
            .completed
            .iter()
            .map(|c| (query.intersection(&tokenize_lower(&c.goal)).count(), c))
            .filter(|(s, _)| *s > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(k).map(|(_, c)| c.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnowledgeSection;

    fn store(history_cap: usize) -> KnowledgeStore {
        KnowledgeStore::in_memory(&KnowledgeSection {
            path: None,
            history_cap,
            completed_cap: 2,
        })
    }

    #[test]
    fn test_archive_dedups_by_goal_and_caps() {
        let mut ks = store(2);
        ks.archive("a", TaskStatus::Stopped, None);
        ks.archive("b", TaskStatus::Completed, Some("ok".into()));
        ks.archive("a", TaskStatus::Completed, Some("done".into()));
        assert_eq!(ks.history().len(), 2);
        assert_eq!(ks.history()[0].goal, "a");
        assert_eq!(ks.history()[0].status, TaskStatus::Completed);

        ks.archive("c", TaskStatus::Failed, None);
        let goals: Vec<_> = ks.history().iter().map(|h| h.goal.as_str()).collect();
        assert_eq!(goals, vec!["c", "a"]);
    }

    #[test]
    fn test_delete_history_by_timestamp() {
        let mut ks = store(10);
        ks.archive("a", TaskStatus::Completed, None);
        let ts = ks.history()[0].timestamp;
        assert!(ks.delete_history(ts));
        assert!(!ks.delete_history(ts));
        assert!(ks.history().is_empty());
    }

    #[test]
    fn test_related_completed_by_overlap() {
        let mut ks = store(10);
        ks.record_completed("book a train to Berlin", "ICE 571");
        ks.record_completed("weather in Paris", "sunny");
        let related = ks.related_completed("train tickets to Berlin tomorrow", 3);
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].answer, "ICE 571");
        // completed_cap = 2
        ks.record_completed("x y", "z");
        assert_eq!(ks.completed().len(), 2);
    }
}
