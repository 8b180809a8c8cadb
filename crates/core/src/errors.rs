use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("无效的参数: {0}")]
    InvalidParam(String),

    #[error("缺少必需参数: {0}")]
    MissingParam(String),

    #[error("调度器不可用: {0}")]
    SchedulerUnavailable(String),

    #[error("进程数已达到上限: 当前 {live}, 上限 {limit}")]
    ForkLimitExceeded { live: usize, limit: usize },

    #[error("所有任务已有其它相同程序执行，本次无需执行")]
    NothingToExecute,

    #[error("创建子进程失败: {0}")]
    ForkFailure(String),

    #[error("从调度器中查询数据时发生错误: {0}")]
    StoreQueryFailure(String),

    #[error("协调存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Numeric error codes, stable across processes and releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ErrorCode {
    #[default]
    Free = 0,
    InvalidParam = 1,
    MissingParam = 2,
    SchedulerUnavailable = 3,
    ForkLimitExceeded = 4,
    NothingToExecute = 5,
    ForkFailure = 6,
    StoreQueryFailure = 7,
    StoreUnavailable = 8,
    System = 9,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code.as_u8()
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ErrorCode::Free,
            1 => ErrorCode::InvalidParam,
            2 => ErrorCode::MissingParam,
            3 => ErrorCode::SchedulerUnavailable,
            4 => ErrorCode::ForkLimitExceeded,
            5 => ErrorCode::NothingToExecute,
            6 => ErrorCode::ForkFailure,
            7 => ErrorCode::StoreQueryFailure,
            8 => ErrorCode::StoreUnavailable,
            9 => ErrorCode::System,
            other => return Err(format!("未知的错误码: {other}")),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl SchedulerError {
    pub fn invalid_param<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParam(msg.into())
    }
    pub fn missing_param<S: Into<String>>(msg: S) -> Self {
        Self::MissingParam(msg.into())
    }
    pub fn query_failure<S: Into<String>>(msg: S) -> Self {
        Self::StoreQueryFailure(msg.into())
    }
    pub fn store_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SchedulerError::InvalidParam(_) => ErrorCode::InvalidParam,
            SchedulerError::MissingParam(_) => ErrorCode::MissingParam,
            SchedulerError::SchedulerUnavailable(_) => ErrorCode::SchedulerUnavailable,
            SchedulerError::ForkLimitExceeded { .. } => ErrorCode::ForkLimitExceeded,
            SchedulerError::NothingToExecute => ErrorCode::NothingToExecute,
            SchedulerError::ForkFailure(_) => ErrorCode::ForkFailure,
            SchedulerError::StoreQueryFailure(_) => ErrorCode::StoreQueryFailure,
            SchedulerError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            SchedulerError::Serialization(_)
            | SchedulerError::TaskExecution(_)
            | SchedulerError::Internal(_) => ErrorCode::System,
        }
    }

    /// Store-level failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::StoreQueryFailure(_) | SchedulerError::StoreUnavailable(_)
        )
    }

    /// `NothingToExecute` is a success path for the caller: the job is
    /// already running elsewhere and its handle stays usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SchedulerError::NothingToExecute)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

/// 最近一次的错误记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub code: ErrorCode,
    pub message: String,
}

impl LastError {
    pub fn record(err: &SchedulerError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.code == ErrorCode::Free
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self {
            code: ErrorCode::Free,
            message: "运行良好，无错误".to_string(),
        }
    }
}
