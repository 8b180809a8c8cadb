use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use packet_core::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

use super::job::{JobIdentity, DEFAULT_NAMESPACE};

/// 调用模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// 启动子进程后立即返回
    #[default]
    Async,
    /// 等待所有子进程退出，或租约到期
    Sync,
}

impl FromStr for CallMode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "async" => Ok(CallMode::Async),
            "sync" => Ok(CallMode::Sync),
            other => Err(SchedulerError::invalid_param(format!(
                "call mode 只能是 async 或 sync: {other}"
            ))),
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallMode::Async => f.write_str("async"),
            CallMode::Sync => f.write_str("sync"),
        }
    }
}

/// 任务包排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortMode {
    #[default]
    #[serde(rename = "normal")]
    Normal,
    /// 按耗时升序，新任务在前
    #[serde(rename = "asc_before")]
    AscNewFirst,
    /// 按耗时升序，新任务在后
    #[serde(rename = "asc_after")]
    AscNewLast,
    #[serde(rename = "desc_before")]
    DescNewFirst,
    #[serde(rename = "desc_after")]
    DescNewLast,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMode::Normal => "normal",
            SortMode::AscNewFirst => "asc_before",
            SortMode::AscNewLast => "asc_after",
            SortMode::DescNewFirst => "desc_before",
            SortMode::DescNewLast => "desc_after",
        }
    }

    pub fn is_ascending(&self) -> bool {
        matches!(self, SortMode::AscNewFirst | SortMode::AscNewLast)
    }

    pub fn new_first(&self) -> bool {
        matches!(self, SortMode::AscNewFirst | SortMode::DescNewFirst)
    }
}

impl FromStr for SortMode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(SortMode::Normal),
            "asc_before" => Ok(SortMode::AscNewFirst),
            "asc_after" => Ok(SortMode::AscNewLast),
            "desc_before" => Ok(SortMode::DescNewFirst),
            "desc_after" => Ok(SortMode::DescNewLast),
            other => Err(SchedulerError::invalid_param(format!(
                "未知的排序方式: {other}"
            ))),
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execute 的调用参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub namespace: String,
    pub worker_count: usize,
    /// 本次最多启动的子进程数，`None` 表示不额外限制
    pub max_fork: Option<usize>,
    pub call_mode: CallMode,
    pub lease: Duration,
    pub sort_mode: SortMode,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            worker_count: 40,
            max_fork: None,
            call_mode: CallMode::Async,
            lease: Duration::from_secs(86_400),
            sort_mode: SortMode::Normal,
        }
    }
}

impl ExecuteOptions {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.worker_count == 0 {
            return Err(SchedulerError::invalid_param("worker_count 必须大于0"));
        }
        if self.max_fork == Some(0) {
            return Err(SchedulerError::invalid_param("max_fork 必须大于0"));
        }
        if self.lease.as_millis() == 0 {
            return Err(SchedulerError::invalid_param("lease 必须大于0"));
        }
        if self.namespace.trim().is_empty() {
            return Err(SchedulerError::invalid_param("namespace 不能为空"));
        }
        Ok(())
    }

    pub fn lease_millis(&self) -> i64 {
        i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX)
    }

    /// Worker count after applying the optional per-call ceiling.
    pub fn effective_workers(&self) -> usize {
        match self.max_fork {
            Some(max) => self.worker_count.min(max),
            None => self.worker_count,
        }
    }
}

/// 启动一个工作单元所需的信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub identity: JobIdentity,
    pub lease_end_ms: i64,
}
