use std::sync::Arc;

use packet_core::{now_millis, SchedulerResult};
use packet_domain::{
    CoordinationStore, JobIdentity, ProcessProbe, ProcessRecord, TableLayout, WorkerEntry,
};
use tracing::{info, warn};

/// 本节点的进程信息表
pub struct ProcessTable {
    store: Arc<dyn CoordinationStore>,
    layout: TableLayout,
    table: String,
    probe: Arc<dyn ProcessProbe>,
    fork_limit: usize,
}

impl ProcessTable {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: &TableLayout,
        probe: Arc<dyn ProcessProbe>,
        fork_limit: usize,
    ) -> Self {
        Self {
            store,
            layout: layout.clone(),
            table: layout.process_table(),
            probe,
            fork_limit,
        }
    }

    /// 某个任务的工作单元表
    pub fn job_workers(&self, identity: &JobIdentity) -> JobWorkers {
        JobWorkers::new(self.store.clone(), &self.layout, identity, self.probe.clone())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fork_limit(&self) -> usize {
        self.fork_limit
    }

    pub async fn register(&self, record: ProcessRecord) -> SchedulerResult<()> {
        self.store
            .set(
                &self.table,
                &record.pid.to_string(),
                &record.lease_expiry.to_string(),
            )
            .await
    }

    pub async fn remove(&self, pid: u32) -> SchedulerResult<()> {
        self.remove_all(&[pid]).await
    }

    pub async fn remove_all(&self, pids: &[u32]) -> SchedulerResult<()> {
        let fields: Vec<String> = pids.iter().map(u32::to_string).collect();
        self.store.delete(&self.table, &fields).await?;
        Ok(())
    }

    /// 先清理失效记录再计数
    pub async fn swept_count(&self) -> SchedulerResult<usize> {
        self.clean_defunct().await?;
        Ok(self.store.length(&self.table).await? as usize)
    }

    /// 当前登记的进程数，达到上限时才清理
    pub async fn live_count(&self) -> SchedulerResult<usize> {
        let count = self.store.length(&self.table).await? as usize;
        if count < self.fork_limit {
            return Ok(count);
        }
        self.clean_defunct().await?;
        Ok(self.store.length(&self.table).await? as usize)
    }

    /// 还能启动的进程数
    pub async fn can_fork_count(&self) -> SchedulerResult<usize> {
        Ok(self.fork_limit.saturating_sub(self.live_count().await?))
    }

    /// 清理已退出和超时运行的进程记录，返回删除的条数
    pub async fn clean_defunct(&self) -> SchedulerResult<usize> {
        let entries = self.store.get_all(&self.table).await?;
        let now = now_millis();

        let mut stale = Vec::new();
        for (field, value) in entries {
            let Some(record) = ProcessRecord::from_entry(&field, &value) else {
                stale.push(field);
                continue;
            };
            if !self.probe.is_alive(record.pid) {
                stale.push(field);
            } else if record.is_expired(now) {
                if self.probe.terminate(record.pid) {
                    info!(pid = record.pid, "终止超时运行的子进程");
                    stale.push(field);
                } else {
                    warn!(pid = record.pid, "failed to kill an expired worker process");
                }
            }
        }

        let removed = stale.len();
        if removed > 0 {
            self.store.delete(&self.table, &stale).await?;
            info!(removed, table = %self.table, "已清理失效的进程记录");
        }
        Ok(removed)
    }
}

/// 正在执行某个任务的工作单元
pub struct JobWorkers {
    store: Arc<dyn CoordinationStore>,
    table: String,
    node: String,
    probe: Arc<dyn ProcessProbe>,
}

impl JobWorkers {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: &TableLayout,
        identity: &JobIdentity,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            store,
            table: layout.job_tables(identity).workers,
            node: layout.node().to_string(),
            probe,
        }
    }

    pub async fn register(&self, pid: u32, lease_end: i64) -> SchedulerResult<()> {
        let entry = WorkerEntry::new(self.node.clone(), pid, lease_end);
        self.store
            .set(&self.table, &entry.field(), &entry.lease_end.to_string())
            .await
    }

    pub async fn remove(&self, pid: u32) -> SchedulerResult<()> {
        let field = WorkerEntry::new(self.node.clone(), pid, 0).field();
        self.store.delete(&self.table, &[field]).await?;
        Ok(())
    }

    /// 租约内仍存活的工作单元数，本节点已退出的记录顺便删除
    pub async fn live_count(&self, now: i64) -> SchedulerResult<usize> {
        let entries = self.store.get_all(&self.table).await?;
        let mut live = 0;
        let mut stale = Vec::new();
        for (field, value) in entries {
            let Some(entry) = WorkerEntry::from_entry(&field, &value) else {
                stale.push(field);
                continue;
            };
            if entry.node == self.node && !self.probe.is_alive(entry.pid) {
                stale.push(field);
            } else if entry.lease_end > now {
                live += 1;
            }
        }
        if !stale.is_empty() {
            self.store.delete(&self.table, &stale).await?;
        }
        Ok(live)
    }
}
