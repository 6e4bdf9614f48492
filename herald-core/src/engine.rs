//! 事件引擎（EventEngine）
//!
//! 把邮箱、订阅注册表、去重守卫、分发器与生命周期控制器组装在一起：
//! - 通过 builder 显式构造与持有，不使用进程级全局实例；
//! - `start` 启动分发器任务，返回用于发布、订阅与关闭的 `EngineHandle`；
//! - 句柄被丢弃且未调用 `stop` 时，分发器会被强制取消。
//!
use crate::config::EventEngineConfig;
use crate::dedup::DedupGuard;
use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherState, StatsSnapshot};
use crate::error::BusResult;
use crate::event::Event;
use crate::handler::EventHandler;
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::mailbox::{DeliveryReceipt, Publisher, mailbox};
use crate::registry::SubscriptionRegistry;
use crate::report::{FailureReporter, TracingReporter};
use bon::Builder;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::event_engine_builder::{IsUnset, SetRegistry, State as BuilderState};

#[derive(Builder)]
pub struct EventEngine {
    #[builder(default)]
    registry: Arc<SubscriptionRegistry>,
    #[builder(default)]
    config: EventEngineConfig,
    /// 仅在消费外部至少一次传输时需要；进程内发布天然恰好一次
    dedup: Option<Arc<DedupGuard>>,
    #[builder(default = Arc::new(TracingReporter) as Arc<dyn FailureReporter>)]
    reporter: Arc<dyn FailureReporter>,
}

impl<S: BuilderState> EventEngineBuilder<S> {
    /// 以 (事件类型, 处理器) 列表初始化注册表
    pub fn subscriptions<I, T>(self, subscriptions: I) -> EventEngineBuilder<SetRegistry<S>>
    where
        <S as BuilderState>::Registry: IsUnset,
        I: IntoIterator<Item = (T, Arc<dyn EventHandler>)>,
        T: Into<String>,
    {
        let registry = SubscriptionRegistry::new();
        for (event_type, handler) in subscriptions {
            registry.subscribe(event_type, handler);
        }
        self.registry(Arc::new(registry))
    }
}

impl EventEngine {
    /// 启动分发器，必须在 tokio 运行时内调用
    pub fn start(self) -> BusResult<EngineHandle> {
        self.config.validate()?;

        let (publisher, receiver) =
            mailbox(self.config.mailbox_capacity, self.config.publish_policy);
        let token = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            receiver,
            self.registry.clone(),
            self.dedup.clone(),
            self.reporter.clone(),
            &self.config,
            token.clone(),
        );
        let stats = dispatcher.stats();
        let dispatcher_state = dispatcher.watch_state();
        let shared = dispatcher.shared();
        let task = tokio::spawn(dispatcher.run());

        info!(
            mailbox_capacity = self.config.mailbox_capacity,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            publish_policy = ?self.config.publish_policy,
            dedup_group = self.dedup.as_ref().map(|g| g.group()),
            "event engine started"
        );

        Ok(EngineHandle {
            publisher,
            registry: self.registry,
            stats,
            lifecycle: LifecycleController::new(shared, token, task, dispatcher_state),
        })
    }
}

/// 引擎运行句柄：发布、订阅、观测与优雅关闭
pub struct EngineHandle {
    publisher: Publisher,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<DispatchStats>,
    lifecycle: LifecycleController,
}

impl EngineHandle {
    /// 可克隆的发布端，交给生产者持有
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub async fn publish(&self, event: Event) -> BusResult<()> {
        self.publisher.publish(event).await
    }

    pub fn try_publish(&self, event: Event) -> BusResult<()> {
        self.publisher.try_publish(event)
    }

    pub async fn publish_tracked(&self, event: Event) -> BusResult<DeliveryReceipt> {
        self.publisher.publish_tracked(event).await
    }

    pub async fn emit(&self, event_type: impl Into<String>, payload: Value) -> BusResult<String> {
        self.publisher.emit(event_type, payload).await
    }

    /// 注册处理器；已停止的引擎不再接受注册，返回 false
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> bool {
        if self.state() == LifecycleState::Stopped {
            return false;
        }
        self.registry.subscribe(event_type, handler)
    }

    /// 注销处理器；已停止的引擎返回 false
    pub fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> bool {
        if self.state() == LifecycleState::Stopped {
            return false;
        }
        self.registry.unsubscribe(event_type, handler)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn outstanding(&self) -> usize {
        self.lifecycle.outstanding()
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.lifecycle.dispatcher_state()
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await
    }

    pub async fn stop_within(&self, timeout: Duration) -> BusResult<()> {
        self.lifecycle.stop_within(timeout).await
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.lifecycle.abort();
    }
}
