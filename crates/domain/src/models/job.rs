use std::fmt;

use chrono::{DateTime, Utc};
use packet_core::{millis_to_datetime, SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

use super::packet::{PacketId, PacketRef};
use super::status::{JobStatus, PacketCounts, StatusBucket};

pub const DEFAULT_NAMESPACE: &str = "default";

/// 任务身份：(命名空间, 回调名)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentity {
    pub namespace: String,
    pub handler: String,
}

impl JobIdentity {
    pub fn new(namespace: impl Into<String>, handler: impl Into<String>) -> SchedulerResult<Self> {
        let namespace = namespace.into();
        let handler = handler.into();
        if handler.trim().is_empty() {
            return Err(SchedulerError::missing_param("handler"));
        }
        if namespace.trim().is_empty() {
            return Err(SchedulerError::invalid_param("namespace 不能为空"));
        }
        for (name, value) in [("namespace", &namespace), ("handler", &handler)] {
            if value.contains(['[', ']']) || value.contains("::") {
                return Err(SchedulerError::invalid_param(format!(
                    "{name} 不能包含 '[', ']' 或 '::': {value}"
                )));
            }
        }
        Ok(Self { namespace, handler })
    }

    /// Key used in the job_info table and in per-job table names.
    pub fn key(&self) -> String {
        format!("{}::{}", self.namespace, self.handler)
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.handler)
    }
}

/// 任务的执行窗口（毫秒时间戳）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl JobWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms: end_ms.max(start_ms),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.end_ms
    }

    pub fn remaining_ms(&self, now: i64) -> i64 {
        (self.end_ms - now).max(0)
    }
}

/// 持久化的任务信息，供子进程和之后的状态查询使用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub identity: JobIdentity,
    pub start_ms: i64,
    pub end_ms: i64,
    pub packets: Vec<PacketRef>,
}

impl JobInfo {
    pub fn window(&self) -> JobWindow {
        JobWindow::new(self.start_ms, self.end_ms)
    }

    pub fn packet_ids(&self) -> Vec<PacketId> {
        self.packets.iter().map(|p| p.id).collect()
    }

    pub fn task_index(&self, id: PacketId) -> Option<usize> {
        self.packets
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.task_index)
    }

    pub fn encode(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> SchedulerResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// 状态查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub identity: JobIdentity,
    pub status: JobStatus,
    pub description: String,
    pub counts: PacketCounts,
    pub buckets: Vec<StatusBucket>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub checked_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(
        identity: JobIdentity,
        status: JobStatus,
        counts: PacketCounts,
        buckets: Vec<StatusBucket>,
        window: JobWindow,
        checked_at_ms: i64,
    ) -> Self {
        Self {
            identity,
            status,
            description: status.description().to_string(),
            counts,
            buckets,
            start_time: millis_to_datetime(window.start_ms),
            end_time: millis_to_datetime(window.end_ms),
            checked_at: millis_to_datetime(checked_at_ms),
        }
    }

    pub fn bucket(&self, status: super::status::PacketStatus) -> Option<&StatusBucket> {
        self.buckets.iter().find(|b| b.status == status)
    }
}
