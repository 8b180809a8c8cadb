use std::sync::Arc;

use anyhow::{Context, Result};
use packet_core::AppConfig;
use packet_domain::{TableLayout, WorkerSpec};
use packet_infrastructure::{connect_store, OsProcessProbe};

use crate::handlers::HandlerRegistry;
use crate::worker::{Worker, WorkerSummary};

/// 子进程入口：连接存储后以本进程 pid 运行一个工作单元
pub async fn run_worker_process(
    config: &AppConfig,
    spec: &WorkerSpec,
    handlers: &HandlerRegistry,
) -> Result<WorkerSummary> {
    let handler = handlers
        .get(&spec.identity.handler)
        .with_context(|| format!("未注册的回调: {}", spec.identity.handler))?;
    let store = connect_store(&config.store)
        .await
        .context("连接协调存储失败")?;
    let layout = TableLayout::new(
        config.scheduler.app_name.clone(),
        config.scheduler.resolve_node_name(),
    );

    let worker = Worker::new(
        store,
        layout,
        Arc::new(OsProcessProbe::new()),
        handler,
        std::process::id(),
    );
    let summary = worker.run(spec).await?;
    Ok(summary)
}
