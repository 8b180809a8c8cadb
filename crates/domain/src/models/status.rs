use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 任务包状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketStatus {
    /// 尚未分配
    Wait,
    /// 已分配且仍在租约内
    Processing,
    /// 按历史耗时判断本轮无法完成，顺延到下一轮
    Delay,
    /// 分配丢失，或租约到期仍没有结果
    Wrong,
    /// 回调明确返回失败
    Failed,
    /// 回调正常结束
    Complete,
}

impl PacketStatus {
    pub const ALL: [PacketStatus; 6] = [
        PacketStatus::Wait,
        PacketStatus::Processing,
        PacketStatus::Delay,
        PacketStatus::Wrong,
        PacketStatus::Failed,
        PacketStatus::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketStatus::Wait => "wait",
            PacketStatus::Processing => "processing",
            PacketStatus::Delay => "delay",
            PacketStatus::Wrong => "wrong",
            PacketStatus::Failed => "failed",
            PacketStatus::Complete => "complete",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PacketStatus::Wait => "等待执行",
            PacketStatus::Processing => "执行中",
            PacketStatus::Delay => "延迟到下一轮执行",
            PacketStatus::Wrong => "执行出错或超时",
            PacketStatus::Failed => "执行失败",
            PacketStatus::Complete => "执行完成",
        }
    }

    /// Statuses written to the result table once a packet is settled.
    pub fn is_finished(&self) -> bool {
        !matches!(self, PacketStatus::Wait | PacketStatus::Processing)
    }
}

impl fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PacketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "wait" => Ok(PacketStatus::Wait),
            "processing" => Ok(PacketStatus::Processing),
            "delay" => Ok(PacketStatus::Delay),
            "wrong" => Ok(PacketStatus::Wrong),
            "failed" => Ok(PacketStatus::Failed),
            "complete" => Ok(PacketStatus::Complete),
            other => Err(format!("Invalid packet status: {other}")),
        }
    }
}

/// 任务（作业）整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobStatus {
    StillWait = 0,
    Processing = 1,
    PartFail = 2,
    WrongStop = 3,
    TimeoutEnd = 4,
    End = 5,
    Complete = 6,
}

impl JobStatus {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::StillWait => "still_wait",
            JobStatus::Processing => "processing",
            JobStatus::PartFail => "part_fail",
            JobStatus::WrongStop => "wrong_stop",
            JobStatus::TimeoutEnd => "timeout_end",
            JobStatus::End => "end",
            JobStatus::Complete => "complete",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            JobStatus::StillWait => "所有任务仍在等待执行",
            JobStatus::Processing => "任务执行中",
            JobStatus::PartFail => "任务执行中，部分任务已失败",
            JobStatus::WrongStop => "执行进程已全部退出，仍有任务未执行",
            JobStatus::TimeoutEnd => "任务超时结束",
            JobStatus::End => "任务已结束，部分任务未成功",
            JobStatus::Complete => "所有任务执行完成",
        }
    }

    /// A terminal status never changes again for the same dispatch.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            JobStatus::StillWait | JobStatus::Processing | JobStatus::PartFail
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "still_wait" => Ok(JobStatus::StillWait),
            "processing" => Ok(JobStatus::Processing),
            "part_fail" => Ok(JobStatus::PartFail),
            "wrong_stop" => Ok(JobStatus::WrongStop),
            "timeout_end" => Ok(JobStatus::TimeoutEnd),
            "end" => Ok(JobStatus::End),
            "complete" => Ok(JobStatus::Complete),
            other => Err(format!("Invalid job status: {other}")),
        }
    }
}

/// 六种任务包状态的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketCounts {
    pub total: usize,
    pub wait: usize,
    pub processing: usize,
    pub delay: usize,
    pub wrong: usize,
    pub failed: usize,
    pub complete: usize,
}

impl PacketCounts {
    pub fn get(&self, status: PacketStatus) -> usize {
        match status {
            PacketStatus::Wait => self.wait,
            PacketStatus::Processing => self.processing,
            PacketStatus::Delay => self.delay,
            PacketStatus::Wrong => self.wrong,
            PacketStatus::Failed => self.failed,
            PacketStatus::Complete => self.complete,
        }
    }

    pub fn add(&mut self, status: PacketStatus, n: usize) {
        match status {
            PacketStatus::Wait => self.wait += n,
            PacketStatus::Processing => self.processing += n,
            PacketStatus::Delay => self.delay += n,
            PacketStatus::Wrong => self.wrong += n,
            PacketStatus::Failed => self.failed += n,
            PacketStatus::Complete => self.complete += n,
        }
    }

    /// Packets that have left the wait set.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.wait)
    }
}

/// 单个状态下的任务明细
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBucket {
    pub status: PacketStatus,
    pub description: String,
    pub total: usize,
    /// 调用方任务列表中的下标
    pub task_ids: Vec<usize>,
}

impl StatusBucket {
    pub fn new(status: PacketStatus, mut task_ids: Vec<usize>) -> Self {
        task_ids.sort_unstable();
        Self {
            status,
            description: status.description().to_string(),
            total: task_ids.len(),
            task_ids,
        }
    }
}
