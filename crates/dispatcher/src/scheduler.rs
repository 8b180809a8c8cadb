use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use packet_core::{
    now_millis, LastError, SchedulerConfig, SchedulerError, SchedulerResult,
};
use packet_domain::{
    CoordinationStore, ExecuteOptions, JobIdentity, JobInfo, JobResult, JobWindow, PacketId,
    PacketRef, TableLayout, Task, WorkerLauncher, WorkerSpec,
};
use tracing::{info, warn};

use crate::aggregator::{load_job_info, save_job_info, JobStatusAggregator};
use crate::launcher::ProcessLauncher;
use crate::ledger::AllocationLedger;
use crate::process_table::ProcessTable;
use crate::registry::PacketRegistry;
use crate::sorter::PacketSorter;

/// 缓存的任务句柄上限
pub const HANDLE_CACHE_CAPACITY: usize = 64;

/// 任务句柄，用于查询某个任务的执行状态
#[derive(Clone)]
pub struct JobHandle {
    aggregator: Arc<JobStatusAggregator>,
}

impl JobHandle {
    fn new(aggregator: JobStatusAggregator) -> Self {
        Self {
            aggregator: Arc::new(aggregator),
        }
    }

    pub fn identity(&self) -> &JobIdentity {
        self.aggregator.identity()
    }

    pub async fn status(&self) -> SchedulerResult<JobResult> {
        self.aggregator.get_status().await
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("identity", self.identity())
            .finish()
    }
}

/// 本次调用的分派结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Launched { pids: Vec<u32> },
    /// 所有任务都已有相同程序在执行，本次没有启动工作单元
    NothingToExecute,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub handle: JobHandle,
    pub dispatch: Dispatch,
}

impl Execution {
    pub fn launched(&self) -> &[u32] {
        match &self.dispatch {
            Dispatch::Launched { pids } => pids,
            Dispatch::NothingToExecute => &[],
        }
    }
}

#[derive(Default)]
struct HandleCache {
    handles: HashMap<JobIdentity, JobHandle>,
    order: VecDeque<JobIdentity>,
}

impl HandleCache {
    fn get(&self, identity: &JobIdentity) -> Option<JobHandle> {
        self.handles.get(identity).cloned()
    }

    fn insert(&mut self, handle: JobHandle) {
        let identity = handle.identity().clone();
        if self.handles.insert(identity.clone(), handle).is_none() {
            self.order.push_back(identity);
        }
        while self.order.len() > HANDLE_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.handles.remove(&oldest);
            }
        }
    }
}

/// 调度器入口，每个应用每个节点一个
pub struct Scheduler {
    store: Arc<dyn CoordinationStore>,
    layout: TableLayout,
    launcher: Arc<dyn WorkerLauncher>,
    registry: PacketRegistry,
    process_table: Arc<ProcessTable>,
    process_launcher: ProcessLauncher,
    table_ttl: Duration,
    handles: Mutex<HandleCache>,
    last_error: Mutex<LastError>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        launcher: Arc<dyn WorkerLauncher>,
        config: &SchedulerConfig,
        table_ttl: Duration,
    ) -> Self {
        let layout = TableLayout::new(config.app_name.clone(), config.resolve_node_name());
        let process_table = Arc::new(ProcessTable::new(
            store.clone(),
            &layout,
            launcher.probe(),
            config.fork_limit,
        ));
        let process_launcher = ProcessLauncher::new(launcher.clone(), process_table.clone(), config);
        Self {
            registry: PacketRegistry::new(store.clone(), layout.clone()),
            store,
            layout,
            launcher,
            process_table,
            process_launcher,
            table_ttl,
            handles: Mutex::new(HandleCache::default()),
            last_error: Mutex::new(LastError::default()),
        }
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// 最近一次的错误
    pub fn last_error(&self) -> LastError {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 本节点当前登记的进程数
    pub async fn process_count(&self) -> SchedulerResult<usize> {
        self.process_table.swept_count().await
    }

    pub async fn can_fork_count(&self) -> SchedulerResult<usize> {
        self.process_table.can_fork_count().await
    }

    /// 分派任务
    pub async fn execute(
        &self,
        handler: &str,
        tasks: &[Task],
        options: &ExecuteOptions,
    ) -> SchedulerResult<Execution> {
        let result = self.try_execute(handler, tasks, options).await;
        match &result {
            Ok(execution) if execution.dispatch == Dispatch::NothingToExecute => {
                self.record_error(&SchedulerError::NothingToExecute);
            }
            Ok(_) => {}
            Err(e) => self.record_error(e),
        }
        result
    }

    /// 查询任务状态，任何知道任务身份的进程都可以查询
    pub async fn get_status(&self, identity: &JobIdentity) -> SchedulerResult<JobResult> {
        let result = self.handle(identity).status().await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    /// 取得（或创建）任务句柄
    pub fn handle(&self, identity: &JobIdentity) -> JobHandle {
        let mut cache = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = cache.get(identity) {
            return handle;
        }
        let handle = self.new_handle(identity);
        cache.insert(handle.clone());
        handle
    }

    fn new_handle(&self, identity: &JobIdentity) -> JobHandle {
        JobHandle::new(JobStatusAggregator::new(
            self.store.clone(),
            self.layout.clone(),
            self.launcher.probe(),
            identity.clone(),
        ))
    }

    fn record_error(&self, err: &SchedulerError) {
        if err.is_recoverable() {
            info!(error = %err, "记录可恢复的错误");
        } else {
            warn!(code = %err.code(), error = %err, "调度失败");
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = LastError::record(err);
    }

    async fn try_execute(
        &self,
        handler: &str,
        tasks: &[Task],
        options: &ExecuteOptions,
    ) -> SchedulerResult<Execution> {
        // 前置检查
        let identity = JobIdentity::new(options.namespace.clone(), handler)?;
        if tasks.is_empty() {
            return Err(SchedulerError::missing_param("tasks"));
        }
        options.validate()?;
        if !self.launcher.has_handler(handler) {
            return Err(SchedulerError::missing_param(format!(
                "未注册的回调: {handler}"
            )));
        }
        self.store.ping().await.map_err(|e| {
            SchedulerError::SchedulerUnavailable(format!(
                "{} 存储不可用: {e}",
                self.store.backend_name()
            ))
        })?;

        let live = self.process_table.live_count().await?;
        let limit = self.process_table.fork_limit();
        if live >= limit {
            return Err(SchedulerError::ForkLimitExceeded { live, limit });
        }
        let can_fork = limit - live;

        // 加载任务
        let packets = self.registry.register(&identity, tasks).await?;
        let now = now_millis();
        let lease_end = now.saturating_add(options.lease_millis());

        // 同一任务仍在执行中时，其任务包都视为已被占用
        let prior = self.active_prior(&identity, now).await?;
        let owned: HashSet<PacketId> = prior
            .as_ref()
            .map(|p| p.packet_ids().into_iter().collect())
            .unwrap_or_default();
        let start_ms = prior.as_ref().map_or(now, |p| p.start_ms.min(now));
        let window = JobWindow::new(start_ms, lease_end);

        let ledger = AllocationLedger::new(
            self.store.clone(),
            self.layout.job_tables(&identity),
            self.layout.node(),
            self.launcher.probe(),
            window,
        );
        let pending = self.pending_packets(&ledger, &packets, &owned).await?;

        if pending.is_empty() {
            info!(job = %identity, "所有任务已有其它相同程序执行，本次无需执行");
            return Ok(Execution {
                handle: self.handle(&identity),
                dispatch: Dispatch::NothingToExecute,
            });
        }

        let sorted = PacketSorter::new(&ledger).sort(&pending, options.sort_mode).await?;
        let fork_num = options
            .effective_workers()
            .min(can_fork)
            .min(sorted.len());

        // 待执行的任务包排在前面，工作单元按此顺序申请
        let pending_ids: HashSet<PacketId> = sorted.iter().map(|p| p.id).collect();
        let mut ordered = sorted;
        ordered.extend(packets.iter().filter(|p| !pending_ids.contains(&p.id)));
        let info = JobInfo {
            identity: identity.clone(),
            start_ms: window.start_ms,
            end_ms: window.end_ms,
            packets: ordered,
        };
        save_job_info(self.store.as_ref(), &self.layout, &info).await?;
        self.refresh_ttl(&identity).await;

        let handle = self.new_handle(&identity);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone());

        info!(
            job = %identity,
            tasks = tasks.len(),
            packets = packets.len(),
            pending = pending_ids.len(),
            workers = fork_num,
            mode = %options.call_mode,
            "开始分派任务"
        );
        let spec = WorkerSpec {
            identity,
            lease_end_ms: window.end_ms,
        };
        let pids = self
            .process_launcher
            .launch(&spec, fork_num, options.call_mode)
            .await?;

        Ok(Execution {
            handle,
            dispatch: Dispatch::Launched { pids },
        })
    }

    /// 上次分派仍在租约内且未结束时返回其任务信息
    async fn active_prior(&self, identity: &JobIdentity, now: i64) -> SchedulerResult<Option<JobInfo>> {
        let Some(prior) = load_job_info(self.store.as_ref(), &self.layout, identity).await? else {
            return Ok(None);
        };
        if prior.window().is_expired(now) {
            return Ok(None);
        }
        let snapshot = self.new_handle(identity).aggregator.snapshot(&prior).await?;
        if snapshot.result.status.is_terminal() {
            return Ok(None);
        }
        Ok(Some(prior))
    }

    async fn pending_packets(
        &self,
        ledger: &AllocationLedger,
        packets: &[PacketRef],
        owned: &HashSet<PacketId>,
    ) -> SchedulerResult<Vec<PacketRef>> {
        let candidates: Vec<PacketId> = packets
            .iter()
            .map(|p| p.id)
            .filter(|id| !owned.contains(id))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let allocated = ledger.reconcile(&candidates).await?;
        let finished = ledger.finish_times(&candidates).await?;
        Ok(packets
            .iter()
            .filter(|p| {
                !owned.contains(&p.id)
                    && !allocated.contains_key(&p.id)
                    && !finished.contains_key(&p.id)
            })
            .copied()
            .collect())
    }

    async fn refresh_ttl(&self, identity: &JobIdentity) {
        let tables = self.layout.job_tables(identity);
        let shared = [
            self.layout.job_info_table(),
            self.layout.id_generator_table(),
            self.layout.process_table(),
        ];
        for table in tables.all().into_iter().chain(shared.iter().map(String::as_str)) {
            if let Err(e) = self.store.expire(table, self.table_ttl).await {
                warn!(table, error = %e, "刷新表过期时间失败");
            }
        }
    }
}
