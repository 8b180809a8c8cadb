use std::sync::Arc;
use std::time::Duration;

use packet_core::{now_millis, SchedulerConfig, SchedulerError, SchedulerResult};
use packet_domain::{CallMode, ProcessProbe, WorkerLauncher, WorkerSpec};
use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::process_table::ProcessTable;

/// 工作单元启动器，与具体的启动方式无关
pub struct ProcessLauncher {
    launcher: Arc<dyn WorkerLauncher>,
    process_table: Arc<ProcessTable>,
    probe: Arc<dyn ProcessProbe>,
    fork_retry_count: u32,
    fork_backoff_max: Duration,
    poll_interval: Duration,
}

impl ProcessLauncher {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        process_table: Arc<ProcessTable>,
        config: &SchedulerConfig,
    ) -> Self {
        let probe = launcher.probe();
        Self {
            launcher,
            process_table,
            probe,
            fork_retry_count: config.fork_retry_count,
            fork_backoff_max: Duration::from_millis(config.fork_backoff_max_ms),
            poll_interval: config.poll_interval(),
        }
    }

    /// 启动 `count` 个工作单元，同步模式下等待全部退出
    pub async fn launch(
        &self,
        spec: &WorkerSpec,
        count: usize,
        mode: CallMode,
    ) -> SchedulerResult<Vec<u32>> {
        let mut pids = Vec::with_capacity(count);
        let mut budget = self.fork_retry_count;
        let mut last_error = None;
        // 进程信息表只由子进程自己登记；这里记到任务名下，
        // 子进程启动前的状态查询也能看到它
        let job_workers = self.process_table.job_workers(&spec.identity);

        while pids.len() < count && budget > 0 {
            match self.launcher.spawn(spec).await {
                Ok(pid) => {
                    job_workers.register(pid, spec.lease_end_ms).await?;
                    pids.push(pid);
                }
                Err(e) => {
                    budget -= 1;
                    warn!(
                        job = %spec.identity,
                        launcher = self.launcher.name(),
                        remaining_retries = budget,
                        error = %e,
                        "启动工作单元失败"
                    );
                    last_error = Some(e);
                    if budget > 0 {
                        sleep(self.fork_backoff()).await;
                    }
                }
            }
        }

        if pids.is_empty() {
            return Err(SchedulerError::ForkFailure(match last_error {
                Some(e) => e.to_string(),
                None => "没有可启动的工作单元".to_string(),
            }));
        }
        info!(
            job = %spec.identity,
            launched = pids.len(),
            requested = count,
            %mode,
            "工作单元已启动"
        );

        if mode == CallMode::Sync {
            self.wait_all(spec, &pids).await?;
        }
        Ok(pids)
    }

    async fn wait_all(&self, spec: &WorkerSpec, pids: &[u32]) -> SchedulerResult<()> {
        loop {
            let alive: Vec<u32> = pids
                .iter()
                .copied()
                .filter(|pid| self.probe.is_alive(*pid))
                .collect();
            if alive.is_empty() {
                return self.process_table.remove_all(pids).await;
            }

            let now = now_millis();
            if now >= spec.lease_end_ms {
                warn!(job = %spec.identity, remaining = alive.len(), "租约到期，终止剩余的工作单元");
                for pid in alive {
                    if !self.probe.terminate(pid) {
                        warn!(pid, "给子进程发送退出信号失败");
                    }
                }
                return self.process_table.remove_all(pids).await;
            }

            let left = Duration::from_millis((spec.lease_end_ms - now) as u64);
            sleep(self.poll_interval.min(left)).await;
        }
    }

    fn fork_backoff(&self) -> Duration {
        let max = self.fork_backoff_max.as_millis() as u64;
        if max <= 1 {
            return Duration::from_millis(max);
        }
        Duration::from_millis(rand::rng().random_range(1..=max))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::tests::FakeProbe;
    use async_trait::async_trait;
    use packet_domain::{CoordinationStore, JobIdentity, TableLayout};
    use packet_infrastructure::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    pub(crate) const PROCESS_TABLE: &str = "test[node-a][process]";

    /// 假的启动器：进程“存活”直到 `finish_all` 或被终止
    pub(crate) struct FakeLauncher {
        pub probe: Arc<FakeProbe>,
        pub next_pid: AtomicU32,
        pub failures: AtomicU32,
        pub spawned: Mutex<Vec<u32>>,
        /// 像真正的子进程一样登记到进程信息表
        store: Option<InMemoryStore>,
    }

    impl FakeLauncher {
        pub fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self::build(failures, None))
        }

        pub fn registering(failures: u32, store: &InMemoryStore) -> Arc<Self> {
            Arc::new(Self::build(failures, Some(store.clone())))
        }

        fn build(failures: u32, store: Option<InMemoryStore>) -> Self {
            Self {
                probe: Arc::new(FakeProbe::default()),
                next_pid: AtomicU32::new(1000),
                failures: AtomicU32::new(failures),
                spawned: Mutex::new(Vec::new()),
                store,
            }
        }

        pub fn finish_all(&self) {
            self.probe.alive.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn has_handler(&self, handler: &str) -> bool {
            handler == "echo"
        }

        async fn spawn(&self, spec: &WorkerSpec) -> SchedulerResult<u32> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SchedulerError::Internal("spawn refused".into()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.probe.alive.lock().unwrap().insert(pid);
            self.spawned.lock().unwrap().push(pid);
            if let Some(store) = &self.store {
                store
                    .set(PROCESS_TABLE, &pid.to_string(), &spec.lease_end_ms.to_string())
                    .await?;
            }
            Ok(pid)
        }

        fn probe(&self) -> Arc<dyn ProcessProbe> {
            self.probe.clone()
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_ms: 10,
            fork_backoff_max_ms: 1,
            ..Default::default()
        }
    }

    fn setup(launcher: Arc<FakeLauncher>) -> (InMemoryStore, ProcessLauncher) {
        let store = InMemoryStore::new();
        let table = Arc::new(ProcessTable::new(
            Arc::new(store.clone()),
            &TableLayout::new("test", "node-a"),
            launcher.probe.clone(),
            100,
        ));
        (store, ProcessLauncher::new(launcher, table, &config()))
    }

    fn spec(lease_ms: i64) -> WorkerSpec {
        WorkerSpec {
            identity: JobIdentity::new("default", "echo").unwrap(),
            lease_end_ms: now_millis() + lease_ms,
        }
    }

    #[tokio::test]
    async fn test_async_launch_records_job_workers() {
        let fake = FakeLauncher::new(0);
        let (store, launcher) = setup(fake.clone());
        let spec = spec(60_000);
        let pids = launcher.launch(&spec, 3, CallMode::Async).await.unwrap();
        assert_eq!(pids.len(), 3);

        // 父进程不写进程信息表
        assert_eq!(store.length(PROCESS_TABLE).await.unwrap(), 0);
        let workers = TableLayout::new("test", "node-a").job_tables(&spec.identity).workers;
        assert_eq!(store.length(&workers).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_shared() {
        // 预算 3 次，前 2 次失败
        let fake = FakeLauncher::new(2);
        let (_, launcher) = setup(fake.clone());
        let pids = launcher.launch(&spec(60_000), 2, CallMode::Async).await.unwrap();
        assert_eq!(pids.len(), 2);

        let fake = FakeLauncher::new(5);
        let (_, launcher) = setup(fake);
        let result = launcher.launch(&spec(60_000), 2, CallMode::Async).await;
        assert!(matches!(result, Err(SchedulerError::ForkFailure(_))));
    }

    #[tokio::test]
    async fn test_sync_returns_when_workers_exit() {
        let fake = FakeLauncher::new(0);
        let (store, launcher) = setup(fake.clone());
        let finisher = {
            let fake = fake.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                fake.finish_all();
            })
        };
        let pids = launcher.launch(&spec(60_000), 2, CallMode::Sync).await.unwrap();
        finisher.await.unwrap();
        assert_eq!(pids.len(), 2);
        assert!(fake.probe.terminated.lock().unwrap().is_empty());
        assert_eq!(store.length(PROCESS_TABLE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_terminates_at_lease_end() {
        let fake = FakeLauncher::new(0);
        let (store, launcher) = setup(fake.clone());
        let pids = launcher.launch(&spec(80), 2, CallMode::Sync).await.unwrap();

        let mut terminated = fake.probe.terminated.lock().unwrap().clone();
        terminated.sort_unstable();
        assert_eq!(terminated, pids);
        assert_eq!(store.length(PROCESS_TABLE).await.unwrap(), 0);
    }
}
