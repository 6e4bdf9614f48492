//! 生命周期控制（LifecycleController）
//!
//! 唯一有权推进生命周期阶段的组件：`Running → Draining → Stopped`。
//! - `stop`：停止接收发布，等待邮箱排空，再切换到 Stopped 并等待分发器退出；
//! - `stop_within`：同上，但排空超过时限后取消分发器并中止正在执行的处理器；
//! - 多次调用是幂等的，后续调用在已停止后立即返回。
//!
use crate::dispatcher::DispatcherState;
use crate::error::{BusError, BusResult};
use crate::mailbox::Shared;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 生命周期阶段，只能向前推进
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    /// 不再接收新发布，已入队的条目继续处理
    Draining,
    /// 终态
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct LifecycleController {
    shared: Arc<Shared>,
    token: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_state: watch::Receiver<DispatcherState>,
}

impl LifecycleController {
    pub(crate) fn new(
        shared: Arc<Shared>,
        token: CancellationToken,
        dispatcher: JoinHandle<()>,
        dispatcher_state: watch::Receiver<DispatcherState>,
    ) -> Self {
        Self {
            shared,
            token,
            dispatcher: Mutex::new(Some(dispatcher)),
            dispatcher_state,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// 已入队但尚未完成的条目数
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding()
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        *self.dispatcher_state.borrow()
    }

    /// 等待未完成计数归零（不改变生命周期阶段）
    pub async fn await_drained(&self) {
        self.shared.await_drained().await
    }

    /// 优雅关闭，返回时已处于 Stopped 且分发器已退出
    pub async fn stop(&self) {
        if let Err(e) = self.shutdown(None).await {
            error!(error = %e, "event engine stopped abnormally");
        }
    }

    /// 限时优雅关闭；超时后强制取消并返回 `StopTimedOut`
    pub async fn stop_within(&self, timeout: Duration) -> BusResult<()> {
        self.shutdown(Some(timeout)).await
    }

    async fn shutdown(&self, timeout: Option<Duration>) -> BusResult<()> {
        // 持锁串行化并发的 stop 调用，后来者等前者完成后直接返回
        let mut dispatcher = self.dispatcher.lock().await;
        let Some(task) = dispatcher.as_mut() else {
            return Ok(());
        };

        if self.shared.advance(LifecycleState::Draining) {
            info!(outstanding = self.outstanding(), "event engine draining");
        }

        // 分发器异常退出时计数不会再归零，同时等待其退出
        let drain = async {
            tokio::select! {
                _ = self.shared.await_drained() => Drain::Drained,
                joined = &mut *task => {
                    if let Err(e) = joined {
                        error!(error = %e, "dispatcher task failed");
                    }
                    Drain::Exited
                }
            }
        };
        let drain = match timeout {
            None => drain.await,
            Some(limit) => tokio::time::timeout(limit, drain)
                .await
                .unwrap_or(Drain::TimedOut),
        };

        let outstanding = self.outstanding();
        match drain {
            Drain::Drained => {}
            Drain::TimedOut => {
                warn!(outstanding, "drain timed out, cancelling dispatcher");
                self.token.cancel();
            }
            Drain::Exited => {
                error!(outstanding, "dispatcher exited before draining");
            }
        }

        self.shared.advance(LifecycleState::Stopped);
        if drain != Drain::Exited {
            if let Err(e) = task.await {
                error!(error = %e, "dispatcher task failed");
            }
        }
        *dispatcher = None;
        info!("event engine stopped");

        match drain {
            Drain::Drained => Ok(()),
            Drain::TimedOut => Err(BusError::StopTimedOut { outstanding }),
            Drain::Exited => Err(BusError::DispatcherExited { outstanding }),
        }
    }

    /// 不等待地强制终止，用于句柄被丢弃的情况
    pub(crate) fn abort(&self) {
        if self.shared.advance(LifecycleState::Stopped) {
            self.token.cancel();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Drain {
    Drained,
    TimedOut,
    /// 分发器在排空前退出
    Exited,
}
