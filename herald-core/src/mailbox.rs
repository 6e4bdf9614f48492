//! 有界邮箱（Mailbox）
//!
//! 基于 `tokio::sync::mpsc` 的有界 FIFO 队列，附带未完成计数：
//! - `Publisher`：可克隆的写端，容量满时阻塞（或按策略立即失败），非运行态立即拒绝；
//! - `MailboxReceiver`：分发器独占的读端，`next_or_timeout` 按固定间隔醒来；
//! - `mark_done`：按值消费条目并递减未完成计数，`await_drained` 等待计数归零。
//!
//! 生命周期阶段与未完成计数放在同一个 `watch` 中，准入检查与计数递增是原子的，
//! 因此进入 Draining 之后不会再有条目“溜进”队列。
//!
use crate::error::{BusError, BusResult};
use crate::event::{DeliveryIdGenerator, Event};
use crate::lifecycle::LifecycleState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// 容量已满时的发布策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// 阻塞直到有空位
    #[default]
    Block,
    /// 立即返回 `MailboxFull`
    FailFast,
}

/// 条目处理结果，由分发器在 `mark_done` 时给出
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 所有处理器均已执行完毕（无论成功与否）
    Handled { succeeded: usize, failed: usize },
    /// 投递标识已见过，处理器未被调用
    Duplicate,
    /// 该类型没有订阅者
    Unrouted,
    /// 强制关闭时被中止，处理器可能未完整执行
    Aborted,
}

#[derive(Clone, Copy, Debug)]
struct Gauge {
    state: LifecycleState,
    outstanding: usize,
}

/// 写端、读端与生命周期控制器共享的状态
#[derive(Debug)]
pub(crate) struct Shared {
    gauge: watch::Sender<Gauge>,
    capacity: usize,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        let (gauge, _rx) = watch::channel(Gauge {
            state: LifecycleState::Running,
            outstanding: 0,
        });
        Self { gauge, capacity }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.gauge.borrow().state
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.gauge.borrow().outstanding
    }

    /// 仅向前推进生命周期阶段，返回是否发生了变化
    pub(crate) fn advance(&self, next: LifecycleState) -> bool {
        self.gauge.send_if_modified(|g| {
            if g.state < next {
                g.state = next;
                true
            } else {
                false
            }
        })
    }

    /// 运行态下原子地占用一个未完成名额
    fn admit(&self) -> BusResult<()> {
        let mut rejected = None;
        self.gauge.send_if_modified(|g| {
            if g.state == LifecycleState::Running {
                g.outstanding += 1;
                true
            } else {
                rejected = Some(g.state);
                false
            }
        });
        match rejected {
            Some(state) => Err(BusError::Rejected { state }),
            None => Ok(()),
        }
    }

    fn complete(&self) {
        self.gauge.send_modify(|g| {
            assert!(g.outstanding > 0, "mark_done without a matching publish");
            g.outstanding -= 1;
        });
    }

    fn ensure_running(&self) -> BusResult<()> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            state => Err(BusError::Rejected { state }),
        }
    }

    /// 等待离开运行态，返回新的阶段
    async fn closed(&self) -> LifecycleState {
        let mut rx = self.gauge.subscribe();
        match rx.wait_for(|g| g.state != LifecycleState::Running).await {
            Ok(g) => g.state,
            Err(_) => LifecycleState::Stopped,
        }
    }

    pub(crate) async fn await_drained(&self) {
        let mut rx = self.gauge.subscribe();
        // 发送端与 self 同生命周期，wait_for 不会因通道关闭而失败
        let _ = rx.wait_for(|g| g.outstanding == 0).await;
    }
}

/// 邮箱中的一个条目：事件与入队时间
#[derive(Debug)]
pub struct MailboxItem {
    event: Arc<Event>,
    enqueued_at: DateTime<Utc>,
    ack: Option<oneshot::Sender<DispatchOutcome>>,
}

impl MailboxItem {
    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

/// 读取结果
#[derive(Debug)]
pub enum Polled {
    Item(MailboxItem),
    /// 轮询间隔内没有数据
    Empty,
    /// 所有写端已释放且队列已空
    Closed,
}

/// 创建容量为 `capacity` 的邮箱
///
/// `capacity` 必须大于 0，由 `EventEngineConfig::validate` 保证。
pub fn mailbox(capacity: usize, policy: PublishPolicy) -> (Publisher, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared::new(capacity));
    let publisher = Publisher {
        tx,
        shared: shared.clone(),
        policy,
        ids: Arc::new(DeliveryIdGenerator::new()),
    };
    (publisher, MailboxReceiver { rx, shared })
}

/// 邮箱写端
#[derive(Clone, Debug)]
pub struct Publisher {
    tx: mpsc::Sender<MailboxItem>,
    shared: Arc<Shared>,
    policy: PublishPolicy,
    ids: Arc<DeliveryIdGenerator>,
}

impl Publisher {
    /// 发布事件；按配置策略在容量满时阻塞或返回 `MailboxFull`
    pub async fn publish(&self, event: Event) -> BusResult<()> {
        self.enqueue(event, None).await
    }

    /// 非阻塞发布，容量满时总是返回 `MailboxFull`
    pub fn try_publish(&self, event: Event) -> BusResult<()> {
        self.shared.ensure_running()?;
        let permit = self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => BusError::MailboxFull {
                capacity: self.shared.capacity,
            },
            mpsc::error::TrySendError::Closed(()) => BusError::Rejected {
                state: LifecycleState::Stopped,
            },
        })?;
        self.shared.admit()?;
        permit.send(MailboxItem::new(event, None));
        Ok(())
    }

    /// 发布并返回回执，回执在分发器完成该条目后就绪
    pub async fn publish_tracked(&self, event: Event) -> BusResult<DeliveryReceipt> {
        let (tx, rx) = oneshot::channel();
        let delivery_id = event.delivery_id().to_string();
        self.enqueue(event, Some(tx)).await?;
        Ok(DeliveryReceipt { delivery_id, rx })
    }

    /// 以单调生成的投递标识发布，返回该标识
    pub async fn emit(&self, event_type: impl Into<String>, payload: Value) -> BusResult<String> {
        let delivery_id = self.ids.next_id();
        let event = Event::builder()
            .event_type(event_type)
            .payload(payload)
            .delivery_id(delivery_id.clone())
            .build();
        self.publish(event).await?;
        Ok(delivery_id)
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    async fn enqueue(
        &self,
        event: Event,
        ack: Option<oneshot::Sender<DispatchOutcome>>,
    ) -> BusResult<()> {
        self.shared.ensure_running()?;

        let permit = match self.policy {
            PublishPolicy::FailFast => self.tx.try_reserve().map_err(|e| match e {
                mpsc::error::TrySendError::Full(()) => BusError::MailboxFull {
                    capacity: self.shared.capacity,
                },
                mpsc::error::TrySendError::Closed(()) => BusError::Rejected {
                    state: LifecycleState::Stopped,
                },
            })?,
            PublishPolicy::Block => {
                tokio::select! {
                    permit = self.tx.reserve() => permit.map_err(|_| BusError::Rejected {
                        state: LifecycleState::Stopped,
                    })?,
                    state = self.shared.closed() => return Err(BusError::Rejected { state }),
                }
            }
        };

        // 持有 permit 期间准入，send 之前不会让出执行权
        self.shared.admit()?;
        permit.send(MailboxItem::new(event, ack));
        Ok(())
    }
}

impl MailboxItem {
    fn new(event: Event, ack: Option<oneshot::Sender<DispatchOutcome>>) -> Self {
        Self {
            event: Arc::new(event),
            enqueued_at: Utc::now(),
            ack,
        }
    }
}

/// 邮箱读端（分发器独占）
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: mpsc::Receiver<MailboxItem>,
    shared: Arc<Shared>,
}

impl MailboxReceiver {
    /// 等待下一个条目，最多等待 `timeout`
    pub async fn next_or_timeout(&mut self, timeout: Duration) -> Polled {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Polled::Item(item),
            Ok(None) => Polled::Closed,
            Err(_) => Polled::Empty,
        }
    }

    /// 完成一个条目：递减未完成计数并通知回执
    pub fn mark_done(&self, item: MailboxItem, outcome: DispatchOutcome) {
        self.shared.complete();
        if let Some(ack) = item.ack {
            // 回执可能已被丢弃，无需处理
            let _ = ack.send(outcome);
        }
    }

    /// 等待未完成计数归零
    pub async fn await_drained(&self) {
        self.shared.await_drained().await
    }

    pub fn outstanding(&self) -> usize {
        self.shared.outstanding()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// 关闭写入并取出所有剩余条目，用于强制关闭
    pub(crate) fn close_and_take_remaining(&mut self) -> Vec<MailboxItem> {
        self.rx.close();
        let mut rest = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            rest.push(item);
        }
        rest
    }
}

/// 发布回执：在条目被 `mark_done` 后就绪
#[derive(Debug)]
pub struct DeliveryReceipt {
    delivery_id: String,
    rx: oneshot::Receiver<DispatchOutcome>,
}

impl DeliveryReceipt {
    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }
}

impl Future for DeliveryReceipt {
    type Output = BusResult<DispatchOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(Ok(outcome)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BusError::Abandoned {
                delivery_id: self.delivery_id.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(id: &str) -> Event {
        Event::builder()
            .event_type("t")
            .delivery_id(id)
            .payload(json!({ "id": id }))
            .build()
    }

    async fn next(rx: &mut MailboxReceiver) -> MailboxItem {
        match rx.next_or_timeout(Duration::from_secs(1)).await {
            Polled::Item(item) => item,
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn items_come_out_in_fifo_order() {
        let (tx, mut rx) = mailbox(8, PublishPolicy::Block);
        for id in ["a", "b", "c"] {
            tx.publish(ev(id)).await.unwrap();
        }
        assert_eq!(rx.outstanding(), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let item = next(&mut rx).await;
            seen.push(item.event().delivery_id().to_string());
            rx.mark_done(item, DispatchOutcome::Unrouted);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(rx.outstanding(), 0);
    }

    #[tokio::test]
    async fn empty_mailbox_wakes_after_timeout() {
        let (_tx, mut rx) = mailbox(1, PublishPolicy::Block);
        let polled = rx.next_or_timeout(Duration::from_millis(10)).await;
        assert!(matches!(polled, Polled::Empty));
    }

    #[tokio::test]
    async fn closed_when_all_publishers_dropped() {
        let (tx, mut rx) = mailbox(1, PublishPolicy::Block);
        drop(tx);
        let polled = rx.next_or_timeout(Duration::from_millis(10)).await;
        assert!(matches!(polled, Polled::Closed));
    }

    #[tokio::test]
    async fn try_publish_reports_full() {
        let (tx, _rx) = mailbox(1, PublishPolicy::Block);
        tx.try_publish(ev("a")).unwrap();
        let err = tx.try_publish(ev("b")).unwrap_err();
        assert!(matches!(err, BusError::MailboxFull { capacity: 1 }));
    }

    #[tokio::test]
    async fn fail_fast_policy_applies_to_publish() {
        let (tx, _rx) = mailbox(1, PublishPolicy::FailFast);
        tx.publish(ev("a")).await.unwrap();
        let err = tx.publish(ev("b")).await.unwrap_err();
        assert!(matches!(err, BusError::MailboxFull { .. }));
    }

    #[tokio::test]
    async fn publish_rejected_once_draining() {
        let (tx, rx) = mailbox(4, PublishPolicy::Block);
        rx.shared().advance(LifecycleState::Draining);
        let err = tx.publish(ev("a")).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Rejected {
                state: LifecycleState::Draining
            }
        ));
        assert!(tx.try_publish(ev("b")).is_err());
        assert_eq!(rx.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_publisher_is_rejected_when_draining_starts() {
        let (tx, rx) = mailbox(1, PublishPolicy::Block);
        tx.publish(ev("a")).await.unwrap();

        let blocked = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.publish(ev("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        rx.shared().advance(LifecycleState::Draining);
        let res = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked publisher must wake")
            .unwrap();
        assert!(matches!(res, Err(BusError::Rejected { .. })));
        assert_eq!(rx.outstanding(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn await_drained_resolves_after_last_mark_done() {
        let (tx, mut rx) = mailbox(4, PublishPolicy::Block);
        tx.publish(ev("a")).await.unwrap();
        tx.publish(ev("b")).await.unwrap();

        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        rx.mark_done(first, DispatchOutcome::Unrouted);

        let drained = tokio::time::timeout(Duration::from_millis(50), rx.await_drained()).await;
        assert!(drained.is_err(), "one item still outstanding");

        rx.mark_done(second, DispatchOutcome::Unrouted);
        tokio::time::timeout(Duration::from_secs(1), rx.await_drained())
            .await
            .expect("drained");
    }

    #[tokio::test]
    async fn receipt_resolves_with_outcome() {
        let (tx, mut rx) = mailbox(2, PublishPolicy::Block);
        let receipt = tx.publish_tracked(ev("a")).await.unwrap();
        assert_eq!(receipt.delivery_id(), "a");

        let item = next(&mut rx).await;
        rx.mark_done(item, DispatchOutcome::Duplicate);
        assert_eq!(receipt.await.unwrap(), DispatchOutcome::Duplicate);
    }

    #[tokio::test]
    async fn receipt_reports_abandoned_when_item_dropped() {
        let (tx, rx) = mailbox(2, PublishPolicy::Block);
        let receipt = tx.publish_tracked(ev("a")).await.unwrap();
        drop(rx);
        assert!(matches!(receipt.await, Err(BusError::Abandoned { .. })));
    }

    #[tokio::test]
    async fn emit_generates_increasing_ids() {
        let (tx, mut rx) = mailbox(4, PublishPolicy::Block);
        let a = tx.emit("t", json!(1)).await.unwrap();
        let b = tx.emit("t", json!(2)).await.unwrap();
        assert!(a < b);
        let item = next(&mut rx).await;
        assert_eq!(item.event().delivery_id(), a);
        rx.mark_done(item, DispatchOutcome::Unrouted);
    }
}
