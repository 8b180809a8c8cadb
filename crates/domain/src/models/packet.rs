use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 任务：调用方提供的不透明工作单元，身份由序列化后的内容决定
pub type Task = serde_json::Value;

/// Canonical serialized form of a task. Object keys come out sorted, so two
/// tasks with the same content always serialize to the same string.
pub fn serialize_task(task: &Task) -> String {
    task.to_string()
}

pub fn deserialize_task(raw: &str) -> serde_json::Result<Task> {
    serde_json::from_str(raw)
}

/// 任务包在调度器中的唯一id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(pub u64);

impl PacketId {
    /// Field name used for this packet in every per-job table.
    pub fn field(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

impl FromStr for PacketId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("task_").unwrap_or(s);
        digits
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .map(PacketId)
            .ok_or_else(|| format!("invalid packet id: {s}"))
    }
}

/// A packet id paired with the index of the task in the caller's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketRef {
    pub id: PacketId,
    pub task_index: usize,
}

impl PacketRef {
    pub fn new(id: PacketId, task_index: usize) -> Self {
        Self { id, task_index }
    }
}

/// 分配给子进程执行的任务包
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: PacketId,
    pub task_index: usize,
    pub task: Task,
}
