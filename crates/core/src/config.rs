use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{SchedulerError, SchedulerResult};
use crate::retry::RetryPolicy;

/// 自定义服务器名（当取不到机器名的时候，取此值）
pub const FALLBACK_NODE_NAME: &str = "main-server";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// 协调存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub max_retry_attempts: u32,
    pub retry_min_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// 每张表的过期时间（秒）
    pub table_ttl_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379/0".to_string(),
            max_retry_attempts: 3,
            retry_min_backoff_ms: 300,
            retry_max_backoff_ms: 1000,
            table_ttl_seconds: 8_640_000,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retry_attempts,
            Duration::from_millis(self.retry_min_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
    }

    pub fn table_ttl(&self) -> Duration {
        Duration::from_secs(self.table_ttl_seconds)
    }
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub app_name: String,
    /// 项目内所有应用在单个服务器中同时存在的最大进程数
    pub fork_limit: usize,
    pub default_fork_num: usize,
    pub default_lease_seconds: u64,
    pub poll_interval_ms: u64,
    pub fork_retry_count: u32,
    pub fork_backoff_max_ms: u64,
    pub node_name: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            app_name: "packet-scheduler".to_string(),
            fork_limit: 800,
            default_fork_num: 40,
            default_lease_seconds: 86_400,
            poll_interval_ms: 1000,
            fork_retry_count: 3,
            fork_backoff_max_ms: 1000,
            node_name: None,
        }
    }
}

impl SchedulerConfig {
    /// Configured node name, else the machine hostname, else a fixed fallback.
    pub fn resolve_node_name(&self) -> String {
        if let Some(name) = self.node_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| FALLBACK_NODE_NAME.to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_lease(&self) -> Duration {
        Duration::from_secs(self.default_lease_seconds)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!(
                "Invalid log format: {s}. Valid formats: pretty, json, compact"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = [
                "config/packet-scheduler.toml",
                "packet-scheduler.toml",
                "/etc/packet-scheduler/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("PACKET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("解析配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.store.url.trim().is_empty() && self.store.backend == StoreBackend::Redis {
            return Err(SchedulerError::invalid_param("store.url 不能为空"));
        }
        if self.store.max_retry_attempts == 0 {
            return Err(SchedulerError::invalid_param(
                "store.max_retry_attempts 必须大于0",
            ));
        }
        if self.store.retry_min_backoff_ms > self.store.retry_max_backoff_ms {
            return Err(SchedulerError::invalid_param(
                "store.retry_min_backoff_ms 不能大于 store.retry_max_backoff_ms",
            ));
        }
        if self.scheduler.app_name.trim().is_empty() {
            return Err(SchedulerError::invalid_param("scheduler.app_name 不能为空"));
        }
        if self.scheduler.fork_limit == 0 {
            return Err(SchedulerError::invalid_param(
                "scheduler.fork_limit 必须大于0",
            ));
        }
        if self.scheduler.default_fork_num == 0 {
            return Err(SchedulerError::invalid_param(
                "scheduler.default_fork_num 必须大于0",
            ));
        }
        if self.scheduler.default_lease_seconds == 0 {
            return Err(SchedulerError::invalid_param(
                "scheduler.default_lease_seconds 必须大于0",
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(SchedulerError::invalid_param(
                "scheduler.poll_interval_ms 必须大于0",
            ));
        }
        if self.scheduler.fork_retry_count == 0 {
            return Err(SchedulerError::invalid_param(
                "scheduler.fork_retry_count 必须大于0",
            ));
        }
        Ok(())
    }
}
