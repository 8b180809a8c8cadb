use async_trait::async_trait;

use crate::models::{PacketStatus, Task};

/// 回调的执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// 回调明确返回失败
    Failed,
}

impl TaskOutcome {
    pub fn status(&self) -> PacketStatus {
        match self {
            TaskOutcome::Done => PacketStatus::Complete,
            TaskOutcome::Failed => PacketStatus::Failed,
        }
    }
}

/// 用户回调。`Err` 视为致命错误，工作进程会就此退出
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, task: &Task) -> anyhow::Result<TaskOutcome>;
}
