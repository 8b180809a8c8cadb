use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use packet_core::{AppConfig, StoreBackend};
use packet_dispatcher::{Dispatch, Execution, Scheduler};
use packet_domain::{
    CallMode, CoordinationStore, ExecuteOptions, JobIdentity, JobResult, TableLayout, Task,
    WorkerLauncher,
};
use packet_infrastructure::connect_store;
use packet_worker::{ExecLauncher, HandlerRegistry, TaskLauncher};
use serde_json::{json, Value};
use tracing::info;

/// 一次 `run` 调用
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub handler: String,
    pub tasks: Vec<Task>,
    pub options: ExecuteOptions,
    /// 异步模式下继续等待任务结束
    pub wait: bool,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    store: Arc<dyn CoordinationStore>,
    scheduler: Scheduler,
}

impl Application {
    /// 创建应用实例
    ///
    /// The memory backend runs workers as tasks inside this process. The
    /// redis backend re-runs the current executable once per worker.
    pub async fn new(
        config: AppConfig,
        config_path: Option<PathBuf>,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        let store = connect_store(&config.store)
            .await
            .context("连接协调存储失败")?;
        let handlers = Arc::new(handlers);
        let layout = TableLayout::new(
            config.scheduler.app_name.clone(),
            config.scheduler.resolve_node_name(),
        );

        let launcher: Arc<dyn WorkerLauncher> = match config.store.backend {
            StoreBackend::Memory => Arc::new(TaskLauncher::new(store.clone(), layout, handlers)),
            StoreBackend::Redis => Arc::new(ExecLauncher::current_exe(config_path, handlers)?),
        };
        info!(
            backend = store.backend_name(),
            launcher = launcher.name(),
            app = %config.scheduler.app_name,
            "应用初始化完成"
        );

        let scheduler = Scheduler::new(
            store.clone(),
            launcher,
            &config.scheduler,
            config.store.table_ttl(),
        );
        Ok(Self {
            config,
            store,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// 以配置中的默认值构造调用参数
    pub fn default_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            worker_count: self.config.scheduler.default_fork_num,
            lease: self.config.scheduler.default_lease(),
            ..Default::default()
        }
    }

    pub async fn run(&self, request: &RunRequest) -> Result<Value> {
        let execution = self
            .scheduler
            .execute(&request.handler, &request.tasks, &request.options)
            .await?;

        let result = if request.wait && request.options.call_mode == CallMode::Async {
            self.wait_terminal(&execution).await?
        } else {
            execution.handle.status().await?
        };
        Ok(render_execution(&execution, &result, &self.scheduler))
    }

    pub async fn status(&self, identity: &JobIdentity) -> Result<JobResult> {
        Ok(self.scheduler.get_status(identity).await?)
    }

    pub async fn processes(&self) -> Result<Value> {
        let live = self.scheduler.process_count().await?;
        let can_fork = self.scheduler.can_fork_count().await?;
        Ok(json!({
            "node": self.scheduler.layout().node(),
            "live": live,
            "can_fork": can_fork,
            "limit": self.config.scheduler.fork_limit,
        }))
    }

    async fn wait_terminal(&self, execution: &Execution) -> Result<JobResult> {
        let interval = self.config.scheduler.poll_interval();
        loop {
            let result = execution.handle.status().await?;
            if result.status.is_terminal() {
                return Ok(result);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn render_execution(execution: &Execution, result: &JobResult, scheduler: &Scheduler) -> Value {
    let dispatch = match &execution.dispatch {
        Dispatch::Launched { .. } => "launched",
        Dispatch::NothingToExecute => "nothing_to_execute",
    };
    json!({
        "job": execution.handle.identity().key(),
        "dispatch": dispatch,
        "pids": execution.launched(),
        "last_error": scheduler.last_error(),
        "result": result,
    })
}

/// 从文件读取任务列表，`-` 表示标准输入
///
/// The content is a JSON array, one element per task.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("读取标准输入失败")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("读取任务文件失败: {}", path.display()))?
    };
    parse_tasks(&raw)
}

pub fn parse_tasks(raw: &str) -> Result<Vec<Task>> {
    let value: Value = serde_json::from_str(raw).context("任务列表不是合法的JSON")?;
    match value {
        Value::Array(tasks) => Ok(tasks),
        other => bail!("任务列表必须是JSON数组，实际为: {other}"),
    }
}
