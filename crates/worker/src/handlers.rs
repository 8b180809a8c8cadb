use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use packet_domain::{Task, TaskHandler, TaskOutcome};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 按名字查找回调
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置的 `shell` 和 `echo` 回调
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellHandler));
        registry.register(Arc::new(EchoHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Shell任务参数
#[derive(Debug, Clone, Deserialize)]
pub struct ShellTask {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Shell任务回调
///
/// A string task runs through `sh -c`. An object task is read as
/// [`ShellTask`] and runs the command directly. A non-zero exit marks the
/// packet failed.
pub struct ShellHandler;

impl ShellHandler {
    fn command_for(task: &Task) -> anyhow::Result<Command> {
        if let Some(line) = task.as_str() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            return Ok(cmd);
        }
        if !task.is_object() {
            bail!("shell 任务必须是字符串或对象: {task}");
        }
        let params: ShellTask =
            serde_json::from_value(task.clone()).context("解析Shell任务参数失败")?;
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&params.env_vars);
        Ok(cmd)
    }
}

#[async_trait]
impl TaskHandler for ShellHandler {
    fn name(&self) -> &str {
        "shell"
    }

    async fn handle(&self, task: &Task) -> anyhow::Result<TaskOutcome> {
        let mut cmd = Self::command_for(task)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "启动Shell命令失败");
                return Ok(TaskOutcome::Failed);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            debug!(stdout = %stdout.trim_end(), "Shell任务执行成功");
            Ok(TaskOutcome::Done)
        } else {
            warn!(
                exit_code = ?output.status.code(),
                stderr = %stderr.trim_end(),
                "Shell任务执行失败"
            );
            Ok(TaskOutcome::Failed)
        }
    }
}

/// 打印任务内容
///
/// Objects may carry `sleep_ms` to simulate work and `fail: true` to report
/// a failed packet. `panic: true` returns a fatal error.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, task: &Task) -> anyhow::Result<TaskOutcome> {
        info!(task = %task, "echo");
        if let Some(ms) = task.get("sleep_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if task.get("panic").and_then(|v| v.as_bool()) == Some(true) {
            bail!("echo 任务要求中止: {task}");
        }
        if task.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(TaskOutcome::Failed);
        }
        Ok(TaskOutcome::Done)
    }
}
