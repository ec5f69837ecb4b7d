//! 会话监管：延迟任务的生命周期
//!
//! 持有根 CancellationToken；每个延迟恢复（LONG_WAIT）拿一个子 token，
//! STOP / RESET / 接管时取消，到期前被取消的定时器不会投递任何事件。

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::events::Event;

#[derive(Debug)]
pub struct SessionSupervisor {
    /// 退出时触发，连带取消所有子 token
    cancel_token: CancellationToken,
    /// 当前挂起的延迟恢复
    pending: Option<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            pending: None,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// delay 之后把 event 投递回编排器；同一时刻只保留一个延迟任务
    pub fn defer(&mut self, delay: Duration, tx: mpsc::UnboundedSender<Event>, event: Event) {
        self.cancel_pending();
        let token = self.cancel_token.child_token();
        self.pending = Some(token.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("deferred resume cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if tx.send(event).is_err() {
                        tracing::debug!("orchestrator gone, dropping deferred resume");
                    }
                }
            }
        });
    }

    /// 取消挂起的延迟任务，返回是否确有任务被取消
    pub fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// 退出：取消根 token
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
