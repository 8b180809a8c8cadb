use std::collections::HashMap;
use std::sync::Arc;

use packet_core::{now_millis, SchedulerResult};
use packet_domain::{
    Allocation, CoordinationStore, JobTables, JobWindow, PacketId, PacketStatus, ProcessProbe,
};
use tracing::{debug, info, warn};

/// 任务包分配表及完成记录的读写
pub struct AllocationLedger {
    store: Arc<dyn CoordinationStore>,
    tables: JobTables,
    node: String,
    probe: Arc<dyn ProcessProbe>,
    window: JobWindow,
}

impl AllocationLedger {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        tables: JobTables,
        node: impl Into<String>,
        probe: Arc<dyn ProcessProbe>,
        window: JobWindow,
    ) -> Self {
        Self {
            store,
            tables,
            node: node.into(),
            probe,
            window,
        }
    }

    pub fn tables(&self) -> &JobTables {
        &self.tables
    }

    pub fn window(&self) -> JobWindow {
        self.window
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// 读取分配记录，结构不合法的记录直接从分配表删除
    pub async fn allocations(
        &self,
        ids: &[PacketId],
    ) -> SchedulerResult<HashMap<PacketId, Allocation>> {
        let fields: Vec<String> = ids.iter().map(PacketId::field).collect();
        let values = self.store.multi_get(&self.tables.pool, &fields).await?;

        let mut list = HashMap::new();
        let mut malformed = Vec::new();
        for ((id, field), value) in ids.iter().zip(fields).zip(values) {
            let Some(raw) = value else {
                continue;
            };
            match Allocation::parse(&raw) {
                Some(allocation) => {
                    list.insert(*id, allocation);
                }
                None => {
                    warn!(packet_id = %id, raw = %raw, "分配记录格式错误，删除");
                    malformed.push(field);
                }
            }
        }
        if !malformed.is_empty() {
            self.store.delete(&self.tables.pool, &malformed).await?;
        }
        Ok(list)
    }

    /// 核对分配记录，返回仍合法执行中的任务包
    pub async fn reconcile(
        &self,
        ids: &[PacketId],
    ) -> SchedulerResult<HashMap<PacketId, Allocation>> {
        let mut list = self.allocations(ids).await?;
        let now = now_millis();

        let mut stale = Vec::new();
        for (id, allocation) in &list {
            let local = allocation.node == self.node;
            let alive = local && self.probe.is_alive(allocation.pid);
            if allocation.within_lease(now) && (!local || alive) {
                continue;
            }

            if !allocation.within_lease(now) && alive {
                info!(packet_id = %id, pid = allocation.pid, "子进程运行超时，终止");
                if !self.probe.terminate(allocation.pid) {
                    warn!(pid = allocation.pid, "给子进程发送退出信号失败");
                }
            }

            let status = if allocation.lease_duration() > self.window.remaining_ms(now) {
                PacketStatus::Delay
            } else {
                PacketStatus::Wrong
            };
            stale.push((*id, status, allocation.apply_time));
        }

        for (id, status, apply_time) in stale {
            debug!(packet_id = %id, %status, "回收失效的分配记录");
            self.report(id, status, Some(apply_time)).await?;
            list.remove(&id);
        }
        Ok(list)
    }

    /// 保存任务包的执行结果（结果、完成时间、耗时），并删除分配记录
    pub async fn report(
        &self,
        id: PacketId,
        status: PacketStatus,
        start_time: Option<i64>,
    ) -> SchedulerResult<()> {
        let field = id.field();
        let end_time = now_millis();
        self.store
            .set(&self.tables.result, &field, status.as_str())
            .await?;
        self.store
            .set(&self.tables.end_time, &field, &end_time.to_string())
            .await?;
        if let Some(start) = start_time {
            let cost = (end_time - start).max(0);
            self.store
                .set(&self.tables.cost, &field, &cost.to_string())
                .await?;
        }
        self.release(id).await
    }

    pub async fn release(&self, id: PacketId) -> SchedulerResult<()> {
        self.store.delete(&self.tables.pool, &[id.field()]).await?;
        Ok(())
    }

    /// Finish times recorded since the job started.
    pub async fn finish_times(&self, ids: &[PacketId]) -> SchedulerResult<HashMap<PacketId, i64>> {
        let values = self.read_numbers(&self.tables.end_time, ids).await?;
        Ok(values
            .into_iter()
            .filter(|(_, end)| *end > 0 && *end >= self.window.start_ms)
            .collect())
    }

    /// 已完成任务包的结果，结果缺失或无法识别的记为 wrong
    pub async fn finished_results(
        &self,
        ids: &[PacketId],
    ) -> SchedulerResult<HashMap<PacketId, PacketStatus>> {
        let finished = self.finish_times(ids).await?;
        let finished_ids: Vec<PacketId> = ids
            .iter()
            .filter(|id| finished.contains_key(id))
            .copied()
            .collect();
        if finished_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let fields: Vec<String> = finished_ids.iter().map(PacketId::field).collect();
        let values = self.store.multi_get(&self.tables.result, &fields).await?;
        Ok(finished_ids
            .into_iter()
            .zip(values)
            .map(|(id, value)| {
                let status = value
                    .and_then(|v| v.parse::<PacketStatus>().ok())
                    .filter(PacketStatus::is_finished)
                    .unwrap_or(PacketStatus::Wrong);
                (id, status)
            })
            .collect())
    }

    /// 历史耗时（毫秒），只包含有记录的任务包
    pub async fn costs(&self, ids: &[PacketId]) -> SchedulerResult<HashMap<PacketId, i64>> {
        self.read_numbers(&self.tables.cost, ids).await
    }

    async fn read_numbers(
        &self,
        table: &str,
        ids: &[PacketId],
    ) -> SchedulerResult<HashMap<PacketId, i64>> {
        let fields: Vec<String> = ids.iter().map(PacketId::field).collect();
        let values = self.store.multi_get(table, &fields).await?;
        Ok(ids
            .iter()
            .zip(values)
            .filter_map(|(id, value)| {
                value
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .map(|n| (*id, n))
            })
            .collect())
    }
}
