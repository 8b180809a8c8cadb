use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use packet_core::{now_millis, SchedulerResult};
use packet_domain::{
    CoordinationStore, JobIdentity, JobInfo, JobResult, JobStatus, JobWindow, PacketCounts,
    PacketId, PacketStatus, ProcessProbe, StatusBucket, TableLayout,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ledger::AllocationLedger;
use crate::process_table::JobWorkers;

/// 由六种任务包状态的计数推导任务整体状态
pub fn derive_job_status(counts: &PacketCounts) -> JobStatus {
    if counts.wait == counts.total {
        return JobStatus::StillWait;
    }
    let remaining = counts.remaining();
    if counts.processing > 0 {
        if counts.processing + counts.complete == remaining {
            JobStatus::Processing
        } else {
            JobStatus::PartFail
        }
    } else if counts.wait == 0 {
        if counts.complete == remaining {
            JobStatus::Complete
        } else {
            JobStatus::End
        }
    } else {
        JobStatus::WrongStop
    }
}

/// 一次状态查询的明细
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub info: JobInfo,
    pub statuses: HashMap<PacketId, PacketStatus>,
    pub result: JobResult,
}

/// 任务状态汇总，终态结果会被缓存
pub struct JobStatusAggregator {
    store: Arc<dyn CoordinationStore>,
    layout: TableLayout,
    probe: Arc<dyn ProcessProbe>,
    identity: JobIdentity,
    cached: Mutex<Option<JobResult>>,
}

impl JobStatusAggregator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: TableLayout,
        probe: Arc<dyn ProcessProbe>,
        identity: JobIdentity,
    ) -> Self {
        Self {
            store,
            layout,
            probe,
            identity,
            cached: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    pub async fn get_status(&self) -> SchedulerResult<JobResult> {
        let mut cached = self.cached.lock().await;
        if let Some(result) = cached.as_ref() {
            if result.status.is_terminal() {
                return Ok(result.clone());
            }
        }

        let result = match load_job_info(self.store.as_ref(), &self.layout, &self.identity).await? {
            Some(info) => self.snapshot(&info).await?.result,
            None => empty_result(&self.identity),
        };
        if result.status.is_terminal() {
            *cached = Some(result.clone());
        }
        Ok(result)
    }

    /// 不经过缓存，重新统计任务的全部任务包
    pub async fn snapshot(&self, info: &JobInfo) -> SchedulerResult<JobSnapshot> {
        let now = now_millis();
        let window = info.window();
        let ledger = AllocationLedger::new(
            self.store.clone(),
            self.layout.job_tables(&info.identity),
            self.layout.node(),
            self.probe.clone(),
            window,
        );
        let ids = info.packet_ids();

        let allocated = ledger.reconcile(&ids).await?;
        let finished = ledger.finish_times(&ids).await?;

        // 等待中：未分配且未完成
        let mut statuses: HashMap<PacketId, PacketStatus> = ids
            .iter()
            .filter(|id| !allocated.contains_key(id) && !finished.contains_key(id))
            .map(|id| (*id, PacketStatus::Wait))
            .collect();

        // 执行中
        statuses.extend(allocated.keys().map(|id| (*id, PacketStatus::Processing)));

        // 已完成的结果覆盖前两者
        statuses.extend(ledger.finished_results(&ids).await?);

        // 哪里都找不到的任务包视为丢失
        let known: HashSet<PacketId> = statuses.keys().copied().collect();
        for id in &ids {
            if !known.contains(id) {
                statuses.insert(*id, PacketStatus::Wrong);
            }
        }

        let mut counts = PacketCounts {
            total: ids.len(),
            ..Default::default()
        };
        let mut grouped: HashMap<PacketStatus, Vec<usize>> = HashMap::new();
        for packet in &info.packets {
            let status = statuses
                .get(&packet.id)
                .copied()
                .unwrap_or(PacketStatus::Wrong);
            counts.add(status, 1);
            grouped.entry(status).or_default().push(packet.task_index);
        }
        let buckets = PacketStatus::ALL
            .iter()
            .map(|s| StatusBucket::new(*s, grouped.remove(s).unwrap_or_default()))
            .collect();

        let mut status = derive_job_status(&counts);
        if status == JobStatus::WrongStop {
            status = self.settle_stopped(info, &counts, &finished, now).await?;
        }
        debug!(job = %info.identity, %status, ?counts, "任务状态已统计");

        Ok(JobSnapshot {
            info: info.clone(),
            statuses,
            result: JobResult::new(info.identity.clone(), status, counts, buckets, window, now),
        })
    }

    /// 没有任务包在执行但仍有等待的任务包
    async fn settle_stopped(
        &self,
        info: &JobInfo,
        counts: &PacketCounts,
        finished: &HashMap<PacketId, i64>,
        now: i64,
    ) -> SchedulerResult<JobStatus> {
        let workers = JobWorkers::new(
            self.store.clone(),
            &self.layout,
            &info.identity,
            self.probe.clone(),
        );
        // 工作单元上报后、申请下一个前不持有分配记录
        if workers.live_count(now).await? > 0 {
            return Ok(if counts.complete == counts.remaining() {
                JobStatus::Processing
            } else {
                JobStatus::PartFail
            });
        }

        // 租约已过且最晚的完成时间晚于租约结束，说明有工作单元超时运行
        let window = info.window();
        match finished.values().max() {
            Some(latest) if window.is_expired(now) && *latest > window.end_ms => {
                Ok(JobStatus::TimeoutEnd)
            }
            _ => Ok(JobStatus::WrongStop),
        }
    }
}

pub async fn load_job_info(
    store: &dyn CoordinationStore,
    layout: &TableLayout,
    identity: &JobIdentity,
) -> SchedulerResult<Option<JobInfo>> {
    let raw = store.get(&layout.job_info_table(), &identity.key()).await?;
    raw.map(|r| JobInfo::decode(&r)).transpose()
}

pub async fn save_job_info(
    store: &dyn CoordinationStore,
    layout: &TableLayout,
    info: &JobInfo,
) -> SchedulerResult<()> {
    store
        .set(&layout.job_info_table(), &info.identity.key(), &info.encode()?)
        .await
}

fn empty_result(identity: &JobIdentity) -> JobResult {
    let now = now_millis();
    let buckets = PacketStatus::ALL
        .iter()
        .map(|s| StatusBucket::new(*s, Vec::new()))
        .collect();
    JobResult::new(
        identity.clone(),
        JobStatus::StillWait,
        PacketCounts::default(),
        buckets,
        JobWindow::new(now, now),
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::FakeProbe;
    use packet_domain::{Allocation, PacketRef};
    use packet_infrastructure::InMemoryStore;

    fn counts(total: usize, wait: usize, processing: usize, complete: usize) -> PacketCounts {
        PacketCounts {
            total,
            wait,
            processing,
            complete,
            failed: total - wait - processing - complete,
            ..Default::default()
        }
    }

    #[test]
    fn test_derivation_table() {
        assert_eq!(derive_job_status(&counts(5, 5, 0, 0)), JobStatus::StillWait);
        assert_eq!(derive_job_status(&counts(5, 0, 3, 2)), JobStatus::Processing);
        assert_eq!(derive_job_status(&counts(5, 0, 2, 2)), JobStatus::PartFail);
        assert_eq!(derive_job_status(&counts(5, 0, 0, 5)), JobStatus::Complete);
        assert_eq!(derive_job_status(&counts(5, 0, 0, 3)), JobStatus::End);
        assert_eq!(derive_job_status(&counts(5, 2, 0, 3)), JobStatus::WrongStop);
        // 等待中的任务包不计入 remaining
        assert_eq!(derive_job_status(&counts(5, 2, 1, 2)), JobStatus::Processing);
        assert_eq!(derive_job_status(&PacketCounts::default()), JobStatus::StillWait);
    }

    fn layout() -> TableLayout {
        TableLayout::new("test", "node-a")
    }

    fn identity() -> JobIdentity {
        JobIdentity::new("default", "echo").unwrap()
    }

    async fn seed_job(store: &InMemoryStore, window: JobWindow, n: u64) -> JobInfo {
        let info = JobInfo {
            identity: identity(),
            start_ms: window.start_ms,
            end_ms: window.end_ms,
            packets: (1..=n).map(|i| PacketRef::new(PacketId(i), i as usize - 1)).collect(),
        };
        save_job_info(store, &layout(), &info).await.unwrap();
        info
    }

    async fn finish(store: &InMemoryStore, id: u64, status: &str, at: i64) {
        let tables = layout().job_tables(&identity());
        store.set(&tables.result, &id.to_string(), status).await.unwrap();
        store.set(&tables.end_time, &id.to_string(), &at.to_string()).await.unwrap();
    }

    fn aggregator(store: &InMemoryStore, probe: Arc<FakeProbe>) -> JobStatusAggregator {
        JobStatusAggregator::new(Arc::new(store.clone()), layout(), probe, identity())
    }

    #[tokio::test]
    async fn test_unknown_job_is_still_wait() {
        let store = InMemoryStore::new();
        let result = aggregator(&store, FakeProbe::with_alive(&[])).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::StillWait);
        assert_eq!(result.counts.total, 0);
        assert_eq!(result.buckets.len(), 6);
    }

    #[tokio::test]
    async fn test_processing_and_buckets() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 5).await;
        let tables = layout().job_tables(&identity());
        for id in 1..=3u64 {
            let alloc = Allocation::new("node-a", 100 + id as u32, now, now + 60_000);
            store.set(&tables.pool, &id.to_string(), &alloc.encode()).await.unwrap();
        }
        finish(&store, 4, "complete", now + 1).await;
        finish(&store, 5, "complete", now + 2).await;

        let probe = FakeProbe::with_alive(&[101, 102, 103]);
        let result = aggregator(&store, probe).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::Processing);
        assert_eq!(result.counts.processing, 3);
        assert_eq!(result.counts.complete, 2);
        assert_eq!(
            result.bucket(PacketStatus::Complete).unwrap().task_ids,
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn test_complete_and_end() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 5).await;
        for id in 1..=5u64 {
            finish(&store, id, "complete", now + 1).await;
        }
        let result = aggregator(&store, FakeProbe::with_alive(&[])).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::Complete);

        finish(&store, 5, "failed", now + 2).await;
        finish(&store, 4, "failed", now + 2).await;
        let fresh = aggregator(&store, FakeProbe::with_alive(&[])).get_status().await.unwrap();
        assert_eq!(fresh.status, JobStatus::End);
        assert_eq!(fresh.counts.complete, 3);
        assert_eq!(fresh.counts.failed, 2);
    }

    #[tokio::test]
    async fn test_wrong_stop_within_lease() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 5).await;
        for id in 1..=3u64 {
            finish(&store, id, "complete", now + 1).await;
        }
        let result = aggregator(&store, FakeProbe::with_alive(&[])).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::WrongStop);
        assert_eq!(result.counts.wait, 2);
    }

    #[tokio::test]
    async fn test_timeout_end_after_lease() {
        let store = InMemoryStore::new();
        let now = now_millis();
        let window = JobWindow::new(now - 10_000, now - 1_000);
        seed_job(&store, window, 5).await;
        finish(&store, 1, "complete", now - 5_000).await;
        finish(&store, 2, "complete", now - 500).await;
        finish(&store, 3, "failed", now - 4_000).await;

        let result = aggregator(&store, FakeProbe::with_alive(&[])).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::TimeoutEnd);
    }

    #[tokio::test]
    async fn test_expired_without_late_finish_stays_wrong_stop() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now - 10_000, now - 1_000), 5).await;
        finish(&store, 1, "complete", now - 5_000).await;

        let result = aggregator(&store, FakeProbe::with_alive(&[])).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::WrongStop);
    }

    #[tokio::test]
    async fn test_terminal_result_is_cached() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 2).await;
        finish(&store, 1, "complete", now + 1).await;
        finish(&store, 2, "complete", now + 1).await;

        let agg = aggregator(&store, FakeProbe::with_alive(&[]));
        assert_eq!(agg.get_status().await.unwrap().status, JobStatus::Complete);

        // 缓存后即使存储不可用也直接返回
        store.set_unavailable(true);
        assert_eq!(agg.get_status().await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_non_terminal_is_requeried() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 1).await;

        let agg = aggregator(&store, FakeProbe::with_alive(&[]));
        assert_eq!(agg.get_status().await.unwrap().status, JobStatus::StillWait);
        finish(&store, 1, "complete", now + 1).await;
        assert_eq!(agg.get_status().await.unwrap().status, JobStatus::Complete);
    }

    async fn register_worker(store: &InMemoryStore, pid: u32, lease_end: i64) {
        let workers = JobWorkers::new(
            Arc::new(store.clone()),
            &layout(),
            &identity(),
            FakeProbe::with_alive(&[]),
        );
        workers.register(pid, lease_end).await.unwrap();
    }

    #[tokio::test]
    async fn test_gap_between_packets_is_not_wrong_stop() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 5).await;
        finish(&store, 1, "complete", now + 1).await;
        finish(&store, 2, "complete", now + 2).await;
        // 工作单元已上报 2 号，还没申请下一个
        register_worker(&store, 31, now + 60_000).await;

        let probe = FakeProbe::with_alive(&[31]);
        let agg = aggregator(&store, probe.clone());
        let result = agg.get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::Processing);
        assert_eq!(result.counts.wait, 3);
        assert_eq!(result.counts.processing, 0);

        // 同一个句柄之后仍能看到最终状态
        for id in 3..=5u64 {
            finish(&store, id, "complete", now + 3).await;
        }
        probe.alive.lock().unwrap().clear();
        assert_eq!(agg.get_status().await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_gap_after_failed_packet_is_part_fail() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 3).await;
        finish(&store, 1, "failed", now + 1).await;
        register_worker(&store, 41, now + 60_000).await;

        let result = aggregator(&store, FakeProbe::with_alive(&[41])).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::PartFail);
    }

    #[tokio::test]
    async fn test_dead_worker_entry_allows_wrong_stop() {
        let store = InMemoryStore::new();
        let now = now_millis();
        seed_job(&store, JobWindow::new(now, now + 60_000), 3).await;
        finish(&store, 1, "complete", now + 1).await;
        register_worker(&store, 51, now + 60_000).await;

        let result = aggregator(&store, FakeProbe::with_alive(&[])).get_status().await.unwrap();
        assert_eq!(result.status, JobStatus::WrongStop);
        let tables = layout().job_tables(&identity());
        assert_eq!(store.length(&tables.workers).await.unwrap(), 0);
    }
}
