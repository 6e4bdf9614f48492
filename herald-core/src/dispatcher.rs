//! 分发器（Dispatcher）
//!
//! 长驻循环 `Idle → Polling → Dispatching → Idle`：
//! 1. 以轮询间隔从邮箱取条目，超时则复查生命周期；
//! 2. 配置了去重守卫时先检查投递标识，重复则直接完成；
//! 3. 解析该类型的处理器，没有订阅者则直接完成；
//! 4. 每个处理器各自 spawn 为独立任务并发执行，失败（错误、panic、超时）互不影响；
//! 5. 等待全部处理器结束后才 `mark_done`，上游（如位点提交）据此获得至少一次保证。
//!
use crate::config::EventEngineConfig;
use crate::dedup::DedupGuard;
use crate::error::{FailureKind, HandlerFailure};
use crate::event::Event;
use crate::handler::EventHandler;
use crate::lifecycle::LifecycleState;
use crate::mailbox::{DispatchOutcome, MailboxItem, MailboxReceiver, Polled, Shared};
use crate::registry::SubscriptionRegistry;
use crate::report::FailureReporter;
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// 分发器状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Polling,
    Dispatching,
    /// 循环已退出
    Exited,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    dispatched: AtomicU64,
    duplicates: AtomicU64,
    unrouted: AtomicU64,
    handler_failures: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// 分发统计快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// 至少有一个处理器执行过的事件数
    pub dispatched: u64,
    /// 被去重守卫拦下的事件数
    pub duplicates: u64,
    /// 无订阅者的事件数
    pub unrouted: u64,
    /// 处理器失败次数（按处理器计）
    pub handler_failures: u64,
}

pub(crate) struct Dispatcher {
    mailbox: MailboxReceiver,
    registry: Arc<SubscriptionRegistry>,
    dedup: Option<Arc<DedupGuard>>,
    reporter: Arc<dyn FailureReporter>,
    poll_interval: Duration,
    handler_timeout: Option<Duration>,
    stats: Arc<DispatchStats>,
    state: watch::Sender<DispatcherState>,
    token: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        mailbox: MailboxReceiver,
        registry: Arc<SubscriptionRegistry>,
        dedup: Option<Arc<DedupGuard>>,
        reporter: Arc<dyn FailureReporter>,
        config: &EventEngineConfig,
        token: CancellationToken,
    ) -> Self {
        let (state, _rx) = watch::channel(DispatcherState::Idle);
        Self {
            mailbox,
            registry,
            dedup,
            reporter,
            poll_interval: config.poll_interval,
            handler_timeout: config.handler_timeout,
            stats: Arc::new(DispatchStats::default()),
            state,
            token,
        }
    }

    pub(crate) fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.mailbox.shared()
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.state.send_replace(DispatcherState::Polling);
            let polled = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                polled = self.mailbox.next_or_timeout(self.poll_interval) => polled,
            };

            match polled {
                Polled::Item(item) => {
                    self.state.send_replace(DispatcherState::Dispatching);
                    if !self.dispatch(item).await {
                        break;
                    }
                }
                Polled::Empty => {
                    if self.mailbox.state() == LifecycleState::Stopped {
                        break;
                    }
                }
                Polled::Closed => break,
            }
            self.state.send_replace(DispatcherState::Idle);
        }

        // 强制关闭：剩余条目全部以 Aborted 完成，保持未完成计数一致
        if self.token.is_cancelled() {
            for item in self.mailbox.close_and_take_remaining() {
                self.mailbox.mark_done(item, DispatchOutcome::Aborted);
            }
        }
        self.state.send_replace(DispatcherState::Exited);
        debug!("dispatcher loop exited");
    }

    /// 处理一个条目；被取消时返回 false
    async fn dispatch(&self, item: MailboxItem) -> bool {
        let event = item.event().clone();

        if let Some(guard) = &self.dedup {
            if !guard.should_process(event.delivery_id()) {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_type = %event.event_type(),
                    delivery_id = %event.delivery_id(),
                    group = %guard.group(),
                    "duplicate delivery suppressed"
                );
                self.mailbox.mark_done(item, DispatchOutcome::Duplicate);
                return true;
            }
        }

        let handlers = self.registry.handlers_for(event.event_type());
        if handlers.is_empty() {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(
                event_type = %event.event_type(),
                delivery_id = %event.delivery_id(),
                "no handlers subscribed"
            );
            self.mailbox.mark_done(item, DispatchOutcome::Unrouted);
            return true;
        }

        let fanout = handlers.len();
        match self.fan_out(handlers, event.clone()).await {
            Some(outcome) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_type = %event.event_type(),
                    delivery_id = %event.delivery_id(),
                    handlers = fanout,
                    outcome = ?outcome,
                    latency_ms = (Utc::now() - item.enqueued_at()).num_milliseconds(),
                    "event dispatched"
                );
                self.mailbox.mark_done(item, outcome);
                true
            }
            None => {
                // 处理器未完整执行，撤销去重记录，重投时重新处理
                if let Some(guard) = &self.dedup {
                    guard.forget(event.delivery_id());
                }
                self.mailbox.mark_done(item, DispatchOutcome::Aborted);
                false
            }
        }
    }

    /// 并发调用所有处理器并等待全部结束；被取消时中止剩余处理器并返回 None
    async fn fan_out(
        &self,
        handlers: Vec<Arc<dyn EventHandler>>,
        event: Arc<Event>,
    ) -> Option<DispatchOutcome> {
        let mut set = JoinSet::new();
        let mut names = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let name = handler.handler_name().to_string();
            let abort = set.spawn(invoke(handler, event.clone(), self.handler_timeout));
            names.insert(abort.id(), name);
        }

        let mut succeeded = 0;
        let mut failed = 0;
        loop {
            let joined = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    set.abort_all();
                    return None;
                }
                joined = set.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (id, kind, reason) = match joined {
                Ok((_, Ok(()))) => {
                    succeeded += 1;
                    continue;
                }
                Ok((id, Err((kind, reason)))) => (id, kind, reason),
                Err(err) => {
                    let id = err.id();
                    if err.is_panic() {
                        (id, FailureKind::Panic, panic_message(err.into_panic()))
                    } else {
                        (id, FailureKind::Error, err.to_string())
                    }
                }
            };

            failed += 1;
            self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
            let failure = HandlerFailure {
                handler: names.get(&id).cloned().unwrap_or_default(),
                event_type: event.event_type().to_string(),
                delivery_id: event.delivery_id().to_string(),
                kind,
                reason,
            };
            self.report(&failure).await;
        }

        Some(DispatchOutcome::Handled { succeeded, failed })
    }

    /// 上报器在分发任务上执行，其 panic 在此截获，不影响分发循环
    async fn report(&self, failure: &HandlerFailure) {
        let reported = AssertUnwindSafe(self.reporter.report(failure))
            .catch_unwind()
            .await;
        if let Err(payload) = reported {
            error!(
                handler = %failure.handler,
                event_type = %failure.event_type,
                delivery_id = %failure.delivery_id,
                panic = %panic_message(payload),
                "failure reporter panicked"
            );
        }
    }
}

async fn invoke(
    handler: Arc<dyn EventHandler>,
    event: Arc<Event>,
    timeout: Option<Duration>,
) -> Result<(), (FailureKind, String)> {
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handler.handle(&event)).await {
            Ok(result) => result,
            Err(_) => {
                return Err((
                    FailureKind::Timeout,
                    format!("exceeded {}ms", limit.as_millis()),
                ));
            }
        },
        None => handler.handle(&event).await,
    };
    result.map_err(|e| (FailureKind::Error, format!("{e:#}")))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
