use std::sync::Arc;
use std::time::Duration;

use packet_core::{now_millis, SchedulerError, SchedulerResult};
use packet_dispatcher::{load_job_info, ProcessTable, WorkAllocator};
use packet_domain::{
    CoordinationStore, JobInfo, PacketStatus, ProcessProbe, ProcessRecord, TableLayout,
    TaskHandler, WorkerSpec,
};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// 一个工作单元的执行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub pid: u32,
    pub handled: usize,
    pub complete: usize,
    pub failed: usize,
    /// 租约到期时仍在执行
    pub lease_expired: bool,
}

/// 工作单元：循环申请任务包、执行回调、上报结果
pub struct Worker {
    store: Arc<dyn CoordinationStore>,
    layout: TableLayout,
    probe: Arc<dyn ProcessProbe>,
    handler: Arc<dyn TaskHandler>,
    pid: u32,
}

impl Worker {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: TableLayout,
        probe: Arc<dyn ProcessProbe>,
        handler: Arc<dyn TaskHandler>,
        pid: u32,
    ) -> Self {
        Self {
            store,
            layout,
            probe,
            handler,
            pid,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// 执行到没有任务包或租约到期，退出前删除自己的登记
    pub async fn run(&self, spec: &WorkerSpec) -> SchedulerResult<WorkerSummary> {
        let info = load_job_info(self.store.as_ref(), &self.layout, &spec.identity)
            .await?
            .ok_or_else(|| SchedulerError::Internal(format!("任务信息不存在: {}", spec.identity)))?;

        // 进程数上限由父进程控制，这里只登记和删除记录
        let table = ProcessTable::new(self.store.clone(), &self.layout, self.probe.clone(), usize::MAX);
        let job_workers = table.job_workers(&spec.identity);
        table
            .register(ProcessRecord::new(self.pid, spec.lease_end_ms))
            .await?;
        if let Err(e) = job_workers.register(self.pid, spec.lease_end_ms).await {
            let _ = table.remove(self.pid).await;
            return Err(e);
        }
        info!(pid = self.pid, job = %spec.identity, "工作单元启动");

        let left = Duration::from_millis(spec.lease_end_ms.saturating_sub(now_millis()).max(0) as u64);
        let mut summary = WorkerSummary {
            pid: self.pid,
            ..Default::default()
        };
        let result = match timeout(left, self.work(&info, &mut summary)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(pid = self.pid, job = %spec.identity, "租约到期，工作单元退出");
                summary.lease_expired = true;
                Ok(())
            }
        };

        if let Err(e) = job_workers.remove(self.pid).await {
            warn!(pid = self.pid, error = %e, "删除任务工作单元记录失败");
        }
        if let Err(e) = table.remove(self.pid).await {
            warn!(pid = self.pid, error = %e, "删除进程记录失败");
        }
        result?;
        info!(
            pid = self.pid,
            handled = summary.handled,
            complete = summary.complete,
            failed = summary.failed,
            "工作单元结束"
        );
        Ok(summary)
    }

    async fn work(&self, info: &JobInfo, summary: &mut WorkerSummary) -> SchedulerResult<()> {
        let mut allocator = WorkAllocator::new(
            self.store.clone(),
            &self.layout,
            self.probe.clone(),
            info,
            self.pid,
        );

        while let Some(packet) = allocator.apply().await? {
            debug!(pid = self.pid, packet_id = %packet.id, task_index = packet.task_index, "执行任务包");
            match self.handler.handle(&packet.task).await {
                Ok(outcome) => {
                    let status = outcome.status();
                    allocator.report(packet.id, status).await?;
                    summary.handled += 1;
                    match status {
                        PacketStatus::Complete => summary.complete += 1,
                        _ => summary.failed += 1,
                    }
                }
                Err(e) => {
                    error!(pid = self.pid, packet_id = %packet.id, error = %e, "回调执行出错，工作单元退出");
                    allocator.report(packet.id, PacketStatus::Wrong).await?;
                    return Err(SchedulerError::TaskExecution(format!("{}: {e:#}", packet.id)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::EchoHandler;
    use packet_dispatcher::PacketRegistry;
    use packet_domain::{JobIdentity, JobWindow, PacketId};
    use packet_infrastructure::{InMemoryStore, OsProcessProbe};
    use serde_json::json;

    fn layout() -> TableLayout {
        TableLayout::new("test", "node-a")
    }

    async fn seed(store: &InMemoryStore, tasks: &[serde_json::Value], lease_ms: i64) -> WorkerSpec {
        let identity = JobIdentity::new("default", "echo").unwrap();
        let store_arc: Arc<dyn CoordinationStore> = Arc::new(store.clone());
        let packets = PacketRegistry::new(store_arc.clone(), layout())
            .register(&identity, tasks)
            .await
            .unwrap();
        let now = now_millis();
        let window = JobWindow::new(now, now + lease_ms);
        let info = JobInfo {
            identity: identity.clone(),
            start_ms: window.start_ms,
            end_ms: window.end_ms,
            packets,
        };
        packet_dispatcher::aggregator::save_job_info(store_arc.as_ref(), &layout(), &info)
            .await
            .unwrap();
        WorkerSpec {
            identity,
            lease_end_ms: window.end_ms,
        }
    }

    fn worker(store: &InMemoryStore) -> Worker {
        Worker::new(
            Arc::new(store.clone()),
            layout(),
            Arc::new(OsProcessProbe::new()),
            Arc::new(EchoHandler),
            std::process::id(),
        )
    }

    #[tokio::test]
    async fn test_worker_drains_all_packets() {
        let store = InMemoryStore::new();
        let spec = seed(&store, &[json!(1), json!(2), json!({"fail": true})], 10_000).await;

        let summary = worker(&store).run(&spec).await.unwrap();
        assert_eq!(summary.handled, 3);
        assert_eq!(summary.complete, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.lease_expired);

        // 进程记录已删除
        assert_eq!(store.length(&layout().process_table()).await.unwrap(), 0);
        let tables = layout().job_tables(&spec.identity);
        assert_eq!(store.length(&tables.workers).await.unwrap(), 0);
        assert_eq!(store.length(&tables.pool).await.unwrap(), 0);
        assert_eq!(store.length(&tables.result).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_handler_error_stops_worker() {
        let store = InMemoryStore::new();
        let spec = seed(&store, &[json!({"panic": true}), json!(2)], 10_000).await;

        let err = worker(&store).run(&spec).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskExecution(_)));
        assert_eq!(store.length(&layout().process_table()).await.unwrap(), 0);

        let tables = layout().job_tables(&spec.identity);
        let result = store.get(&tables.result, &PacketId(1).field()).await.unwrap();
        assert_eq!(result.as_deref(), Some("wrong"));
    }

    #[tokio::test]
    async fn test_lease_end_stops_worker() {
        let store = InMemoryStore::new();
        let spec = seed(&store, &[json!({"sleep_ms": 5_000})], 100).await;

        let summary = worker(&store).run(&spec).await.unwrap();
        assert!(summary.lease_expired);
        assert_eq!(summary.handled, 0);
        assert_eq!(store.length(&layout().process_table()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_job_info() {
        let store = InMemoryStore::new();
        let spec = WorkerSpec {
            identity: JobIdentity::new("default", "echo").unwrap(),
            lease_end_ms: now_millis() + 1_000,
        };
        assert!(matches!(
            worker(&store).run(&spec).await,
            Err(SchedulerError::Internal(_))
        ));
    }
}
