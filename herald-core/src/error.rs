//! 事件引擎统一错误定义
//!
//! - `BusError`：发布端与生命周期可见的错误（拒绝、背压、放弃、关闭超时、配置）；
//! - `HandlerFailure`：单个处理器调用的失败记录，只交给失败上报器，不会回传给发布者。
//!
use crate::lifecycle::LifecycleState;
use std::fmt;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 发布端 ---
    #[error("publish rejected: engine is {state}")]
    Rejected { state: LifecycleState },
    #[error("mailbox full: capacity={capacity}")]
    MailboxFull { capacity: usize },
    #[error("delivery abandoned before completion: delivery_id={delivery_id}")]
    Abandoned { delivery_id: String },

    // --- 生命周期 ---
    #[error("stop timed out: outstanding={outstanding}")]
    StopTimedOut { outstanding: usize },
    #[error("dispatcher exited before draining: outstanding={outstanding}")]
    DispatcherExited { outstanding: usize },

    // --- 配置 ---
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
}

impl BusError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        BusError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

/// 处理器失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 处理器返回了错误
    Error,
    /// 处理器发生 panic
    Panic,
    /// 超过了配置的单处理器超时
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// 单次处理器调用的失败记录
#[derive(Debug, Clone, Error)]
#[error(
    "handler failed: handler={handler}, event_type={event_type}, delivery_id={delivery_id}, kind={kind}, reason={reason}"
)]
pub struct HandlerFailure {
    pub handler: String,
    pub event_type: String,
    pub delivery_id: String,
    pub kind: FailureKind,
    pub reason: String,
}
