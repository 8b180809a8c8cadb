use anyhow::{Context, Result};
use packet_core::{init_logging, init_worker_logging, AppConfig};
use packet_scheduler::cli;
use packet_scheduler::Application;
use packet_worker::{run_worker_process, HandlerRegistry};
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::command().get_matches();
    let (name, sub) = matches
        .subcommand()
        .context("缺少子命令")?;

    let config_path = cli::config_path(sub);
    let mut config = AppConfig::load(config_path.as_deref().and_then(|p| p.to_str()))
        .context("加载配置失败")?;
    cli::apply_logging_overrides(sub, &mut config.logging)?;

    let handlers = HandlerRegistry::with_builtins();

    // 工作单元的标准输出留给父进程，日志写到 stderr
    if name == "worker" {
        init_worker_logging(&config.logging)?;
        let spec = cli::worker_spec(sub)?;
        let summary = run_worker_process(&config, &spec, &handlers).await?;
        info!(pid = summary.pid, handled = summary.handled, "工作单元退出");
        return Ok(());
    }

    init_logging(&config.logging)?;
    let app = Application::new(config, config_path, handlers).await?;

    let output: Value = match name {
        "run" => {
            let request = cli::run_request(sub, app.default_options())?;
            tokio::select! {
                result = app.run(&request) => result?,
                _ = signal::ctrl_c() => {
                    warn!("收到中断信号，已启动的工作单元将继续运行到租约结束");
                    return Ok(());
                }
            }
        }
        "status" => {
            let identity = cli::identity(sub)?;
            serde_json::to_value(app.status(&identity).await?)?
        }
        "processes" => app.processes().await?,
        other => anyhow::bail!("不支持的子命令: {other}"),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
