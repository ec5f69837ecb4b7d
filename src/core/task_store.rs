//! 任务状态存储：当前唯一任务 + 代际计数
//!
//! 同步、单一所有者（编排器）。每次 create 递增 generation，
//! 后台 continuation 凭 generation 判断自己是否已过期。

use crate::core::state::{Task, TaskSnapshot};

#[derive(Debug, Default)]
pub struct TaskStore {
    task: Option<Task>,
    generation: u64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建新任务（旧任务由调用方先行归档 / 清理）
    pub fn create(&mut self, goal: impl Into<String>) -> &mut Task {
        self.generation += 1;
        self.task.insert(Task::new(goal, self.generation))
    }

    pub fn get(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Task> {
        self.task.as_mut()
    }

    /// 修改当前任务；无任务时返回 None
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.task.as_mut().map(|task| {
            let out = f(task);
            task.touch();
            out
        })
    }

    /// 丢弃当前任务并返回它
    pub fn clear(&mut self) -> Option<Task> {
        self.task.take()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.task.as_ref().is_some_and(|t| t.generation == generation)
    }

    pub fn generation(&self) -> Option<u64> {
        self.task.as_ref().map(|t| t.generation)
    }

    pub fn snapshot(&self) -> Option<TaskSnapshot> {
        self.task.as_ref().map(TaskSnapshot::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::TaskStatus;

    #[test]
    fn test_create_bumps_generation() {
        let mut store = TaskStore::new();
        let first = store.create("a").generation;
        let second = store.create("b").generation;
        assert!(second > first);
        assert!(!store.is_current(first));
        assert!(store.is_current(second));
        assert_eq!(store.get().map(|t| t.goal.as_str()), Some("b"));
    }

    #[test]
    fn test_clear_invalidates_generation() {
        let mut store = TaskStore::new();
        let gen = store.create("a").generation;
        store.mutate(|t| t.status = TaskStatus::Waiting);
        assert_eq!(store.clear().map(|t| t.status), Some(TaskStatus::Waiting));
        assert!(!store.is_current(gen));
        assert!(store.clear().is_none());
        assert!(store.mutate(|t| t.turn += 1).is_none());
    }
}
