use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use packet_core::{SchedulerError, SchedulerResult};
use packet_domain::{
    CoordinationStore, ProcessProbe, TableLayout, WorkerLauncher, WorkerSpec,
};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::handlers::HandlerRegistry;
use crate::worker::Worker;

/// 合成 pid 从这里开始，高于常见系统的 pid 上限
const SYNTHETIC_PID_BASE: u32 = (1 << 22) + 1;

static NEXT_PID: AtomicU32 = AtomicU32::new(SYNTHETIC_PID_BASE);

/// 进程内工作单元的存活表
#[derive(Default)]
pub struct TaskPool {
    tasks: Mutex<HashMap<u32, AbortHandle>>,
}

impl TaskPool {
    fn insert(&self, pid: u32, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(pid, handle);
    }

    fn forget(&self, pid: u32) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }
}

impl ProcessProbe for TaskPool {
    fn is_alive(&self, pid: u32) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .is_some_and(|h| !h.is_finished())
    }

    fn terminate(&self, pid: u32) -> bool {
        match self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
        {
            Some(handle) => {
                let alive = !handle.is_finished();
                handle.abort();
                alive
            }
            None => false,
        }
    }
}

/// 以 tokio 任务的形式运行工作单元，pid 只对本进程的 `TaskPool` 有意义
pub struct TaskLauncher {
    store: Arc<dyn CoordinationStore>,
    layout: TableLayout,
    handlers: Arc<HandlerRegistry>,
    pool: Arc<TaskPool>,
}

impl TaskLauncher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: TableLayout,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            layout,
            handlers,
            pool: Arc::new(TaskPool::default()),
        }
    }

    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    fn name(&self) -> &'static str {
        "task"
    }

    fn has_handler(&self, handler: &str) -> bool {
        self.handlers.contains(handler)
    }

    async fn spawn(&self, spec: &WorkerSpec) -> SchedulerResult<u32> {
        let handler = self
            .handlers
            .get(&spec.identity.handler)
            .ok_or_else(|| SchedulerError::missing_param(format!("未注册的回调: {}", spec.identity.handler)))?;
        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::new(
            self.store.clone(),
            self.layout.clone(),
            self.pool.clone(),
            handler,
            pid,
        );

        let pool = self.pool.clone();
        let spec = spec.clone();
        // 登记到存活表之后才开始执行，否则探测会把它当成已退出
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return;
            }
            match worker.run(&spec).await {
                Ok(summary) => info!(pid, handled = summary.handled, "工作单元任务结束"),
                Err(e) => warn!(pid, error = %e, "工作单元任务异常退出"),
            }
            pool.forget(pid);
        });
        self.pool.insert(pid, join.abort_handle());
        let _ = ready_tx.send(());
        Ok(pid)
    }

    fn probe(&self) -> Arc<dyn ProcessProbe> {
        self.pool.clone()
    }
}
