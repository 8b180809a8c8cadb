use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use packet_core::{now_millis, SchedulerResult, RETRY_COUNT};
use packet_domain::{
    Allocation, CoordinationStore, JobInfo, Packet, PacketId, PacketStatus, ProcessProbe,
    TableLayout,
};
use tracing::{debug, warn};

use crate::ledger::AllocationLedger;
use crate::registry::PacketRegistry;

/// 任务包分配器，每个工作单元持有一个
pub struct WorkAllocator {
    store: Arc<dyn CoordinationStore>,
    ledger: AllocationLedger,
    registry: PacketRegistry,
    pid: u32,
    pending: Vec<PacketId>,
    task_indices: HashMap<PacketId, usize>,
    send_times: HashMap<PacketId, i64>,
}

impl WorkAllocator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: &TableLayout,
        probe: Arc<dyn ProcessProbe>,
        job: &JobInfo,
        pid: u32,
    ) -> Self {
        let tables = layout.job_tables(&job.identity);
        let ledger = AllocationLedger::new(
            store.clone(),
            tables,
            layout.node(),
            probe,
            job.window(),
        );
        Self {
            registry: PacketRegistry::new(store.clone(), layout.clone()),
            store,
            ledger,
            pid,
            pending: job.packet_ids(),
            task_indices: job
                .packets
                .iter()
                .map(|p| (p.id, p.task_index))
                .collect(),
            send_times: HashMap::new(),
        }
    }

    pub fn ledger(&self) -> &AllocationLedger {
        &self.ledger
    }

    /// 重新计算待分配的任务包：去掉已分配和已完成的
    pub async fn refresh_pending(&mut self) -> SchedulerResult<&[PacketId]> {
        if self.pending.is_empty() {
            return Ok(&self.pending);
        }
        let allocated = self.ledger.reconcile(&self.pending).await?;
        self.pending.retain(|id| !allocated.contains_key(id));

        if !self.pending.is_empty() {
            let finished = self.ledger.finish_times(&self.pending).await?;
            self.pending.retain(|id| !finished.contains_key(id));
        }
        Ok(&self.pending)
    }

    /// 申请一个任务包，没有可执行的任务包或租约已过时返回 `None`
    pub async fn apply(&mut self) -> SchedulerResult<Option<Packet>> {
        self.refresh_pending().await?;
        let window = self.ledger.window();
        if self.pending.is_empty() || window.is_expired(now_millis()) {
            return Ok(None);
        }

        let pool = self.ledger.tables().pool.clone();
        let mut passes = RETRY_COUNT;
        while !self.pending.is_empty() && passes > 0 {
            passes -= 1;
            let mut dropped = HashSet::new();

            for id in self.pending.clone() {
                let apply_time = now_millis();
                if apply_time >= window.end_ms {
                    return Ok(None);
                }
                let field = id.field();
                let claim =
                    Allocation::new(self.ledger.node(), self.pid, apply_time, window.end_ms)
                        .encode();

                if self.store.set_if_absent(&pool, &field, &claim).await? {
                    // 抢到之后再确认一次，任务包可能刚被其他路径执行完
                    let finished = self.ledger.finish_times(&[id]).await?;
                    if finished.contains_key(&id) {
                        self.ledger.release(id).await?;
                        dropped.insert(id);
                        continue;
                    }

                    let stored = self.store.get(&pool, &field).await?;
                    if stored.as_deref() == Some(claim.as_str()) {
                        self.pending.retain(|p| *p != id);
                        self.send_times.insert(id, apply_time);

                        match self.registry.load_task(self.ledger.tables(), id).await? {
                            Some(task) => {
                                debug!(packet_id = %id, pid = self.pid, "申请到任务包");
                                return Ok(Some(Packet {
                                    id,
                                    task_index: self.task_indices.get(&id).copied().unwrap_or(0),
                                    task,
                                }));
                            }
                            None => {
                                warn!(packet_id = %id, "任务包内容缺失，记为 wrong");
                                self.report(id, PacketStatus::Wrong).await?;
                                continue;
                            }
                        }
                    }
                }

                if self.store.exists(&pool, &field).await? {
                    dropped.insert(id);
                }
            }

            self.pending.retain(|id| !dropped.contains(id));
        }
        Ok(None)
    }

    /// 上报任务包执行结果
    pub async fn report(&mut self, id: PacketId, status: PacketStatus) -> SchedulerResult<()> {
        let start = self.send_times.remove(&id);
        self.ledger.report(id, status, start).await
    }
}
