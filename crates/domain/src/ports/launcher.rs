use std::sync::Arc;

use async_trait::async_trait;
use packet_core::SchedulerResult;

use crate::models::WorkerSpec;

/// 本机进程存活探测
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Sends a termination signal. Returns false if the process was already gone.
    fn terminate(&self, pid: u32) -> bool;
}

/// 启动工作单元的方式（操作系统进程，或进程内的异步任务）
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a handler with this name can run in launched workers.
    fn has_handler(&self, handler: &str) -> bool;

    /// Starts one worker for the job and returns its pid. The worker is
    /// expected to register and remove its own process record.
    async fn spawn(&self, spec: &WorkerSpec) -> SchedulerResult<u32>;

    /// Liveness view matching the pids this launcher hands out.
    fn probe(&self) -> Arc<dyn ProcessProbe>;
}
