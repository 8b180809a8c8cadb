use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use packet_core::{SchedulerError, SchedulerResult};
use packet_domain::{ProcessProbe, WorkerLauncher, WorkerSpec};
use packet_infrastructure::OsProcessProbe;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::handlers::HandlerRegistry;

/// 以子进程方式启动工作单元
///
/// Re-runs `program` with the `worker` subcommand. Each child reconnects to
/// the shared store and works through the job on its own.
pub struct ExecLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
    handlers: Arc<HandlerRegistry>,
    probe: Arc<OsProcessProbe>,
}

impl ExecLauncher {
    pub fn new(program: PathBuf, config_path: Option<PathBuf>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            program,
            config_path,
            handlers,
            probe: Arc::new(OsProcessProbe::new()),
        }
    }

    /// 使用当前可执行文件
    pub fn current_exe(config_path: Option<PathBuf>, handlers: Arc<HandlerRegistry>) -> SchedulerResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| SchedulerError::ForkFailure(format!("无法获取当前可执行文件路径: {e}")))?;
        Ok(Self::new(program, config_path, handlers))
    }

    pub fn command(&self, spec: &WorkerSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--namespace")
            .arg(&spec.identity.namespace)
            .arg("--handler")
            .arg(&spec.identity.handler)
            .arg("--lease-end")
            .arg(spec.lease_end_ms.to_string());
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        cmd
    }
}

#[async_trait]
impl WorkerLauncher for ExecLauncher {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn has_handler(&self, handler: &str) -> bool {
        self.handlers.contains(handler)
    }

    async fn spawn(&self, spec: &WorkerSpec) -> SchedulerResult<u32> {
        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| SchedulerError::ForkFailure(format!("启动子进程失败: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| SchedulerError::ForkFailure("子进程已退出，无法取得pid".to_string()))?;

        // 回收子进程，避免僵尸进程被误判为存活
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, %status, "子进程退出"),
                Err(e) => warn!(pid, error = %e, "等待子进程退出失败"),
            }
        });
        Ok(pid)
    }

    fn probe(&self) -> Arc<dyn ProcessProbe> {
        self.probe.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_domain::JobIdentity;

    fn spec() -> WorkerSpec {
        WorkerSpec {
            identity: JobIdentity::new("crawl", "shell").unwrap(),
            lease_end_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_worker_command_line() {
        let launcher = ExecLauncher::new(
            PathBuf::from("/usr/bin/packet-scheduler"),
            Some(PathBuf::from("/etc/packet.toml")),
            Arc::new(HandlerRegistry::with_builtins()),
        );
        let cmd = launcher.command(&spec());
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/usr/bin/packet-scheduler");
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "worker",
                "--namespace",
                "crawl",
                "--handler",
                "shell",
                "--lease-end",
                "1700000000000",
                "--config",
                "/etc/packet.toml"
            ]
        );
        assert!(launcher.has_handler("shell"));
        assert!(!launcher.has_handler("nope"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_is_fork_failure() {
        let launcher = ExecLauncher::new(
            PathBuf::from("/definitely/not/a/binary"),
            None,
            Arc::new(HandlerRegistry::with_builtins()),
        );
        assert!(matches!(
            launcher.spawn(&spec()).await,
            Err(SchedulerError::ForkFailure(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_child_is_reaped() {
        // `true` 忽略参数并立即退出
        let launcher = ExecLauncher::new(
            PathBuf::from("true"),
            None,
            Arc::new(HandlerRegistry::with_builtins()),
        );
        let pid = launcher.spawn(&spec()).await.unwrap();
        let probe = launcher.probe();
        let mut waited = 0;
        while probe.is_alive(pid) && waited < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            waited += 1;
        }
        assert!(!probe.is_alive(pid));
    }
}
