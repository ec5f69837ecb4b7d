//! 编排器事件：外部控制命令 + 带代际号的内部 continuation
//!
//! 每个处理步骤返回下一个事件（而不是递归调用自己），由驱动循环排队消费。

use tokio::sync::oneshot;

use crate::core::state::TaskSnapshot;
use crate::env::RecordedAction;
use crate::knowledge::HistoryEntry;

/// 从 UI 发往编排器的控制命令
#[derive(Debug)]
pub enum Command {
    StartTask { goal: String },
    StopTask,
    /// 静默丢弃任务（用户关闭已结束的任务时）
    ResetTaskSession,
    TakeOver,
    GoAutonomous,
    RecordedAction(RecordedAction),
    /// 执行辩论得出的计划；plan 为空时使用任务上保存的辩论计划
    AttemptStrategy { plan: Vec<String> },
    StartTeaching { goal: String },
    StopTeaching,
    UnlockVault { passphrase: String },
    SaveCredential { name: String },
    DeleteHistoricalTask { timestamp: i64 },
    GetTask(oneshot::Sender<Option<TaskSnapshot>>),
    GetHistory(oneshot::Sender<Vec<HistoryEntry>>),
    Quit,
}

/// 编排器自己产生的后续事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Internal {
    AdvanceTurn,
    /// LONG_WAIT 到期
    WaitElapsed,
    Replan { user_initiated: bool },
    TeachingSummarized { summary: Result<String, String> },
}

#[derive(Debug)]
pub enum Event {
    Control(Command),
    /// generation 与当前任务不一致时丢弃
    Internal { generation: u64, kind: Internal },
}

impl Event {
    pub fn internal(generation: u64, kind: Internal) -> Self {
        Event::Internal { generation, kind }
    }
}

impl From<Command> for Event {
    fn from(cmd: Command) -> Self {
        Event::Control(cmd)
    }
}
