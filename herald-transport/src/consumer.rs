//! 传输消费者（TransportConsumer）
//!
//! 把外部“至少一次”传输接入事件引擎：
//! - consume worker：订阅消息源，把消息转换为事件（`delivery_id` 由位点推导），
//!   以带回执的方式发布到引擎；
//! - commit worker：按发布顺序等待回执，条目完成（`mark_done`）后才提交位点。
//!
//! 配合引擎上的去重守卫，重投的消息在处理器视角至多执行一次。
//! 任一位点未能完成（中止或被放弃）时停止提交，之后的位点留给重投。
//!
use crate::error::TransportError;
use crate::message::Position;
use crate::source::MessageSource;
use bon::Builder;
use futures_util::StreamExt;
use herald_core::{DeliveryReceipt, DispatchOutcome, Publisher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Builder)]
pub struct TransportConsumer {
    source: Arc<dyn MessageSource>,
    publisher: Publisher,
    #[builder(into)]
    group: String,
    /// 已发布但尚未提交的消息上限
    #[builder(default = 1024)]
    max_uncommitted: usize,
}

impl TransportConsumer {
    /// 启动消费与提交任务，返回可用于关闭/等待的句柄
    pub fn start(self) -> ConsumerHandle {
        let token = CancellationToken::new();
        let (pending_tx, pending_rx) = mpsc::channel(self.max_uncommitted.max(1));
        let this = Arc::new(self);

        let tasks = vec![
            tokio::spawn(this.clone().consume_loop(token.clone(), pending_tx)),
            tokio::spawn(this.commit_loop(pending_rx)),
        ];
        ConsumerHandle { token, tasks }
    }

    async fn consume_loop(
        self: Arc<Self>,
        token: CancellationToken,
        pending: mpsc::Sender<(DeliveryReceipt, Position)>,
    ) {
        let mut stream = match self.source.subscribe(&self.group).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(group = %self.group, error = %e, "subscribe failed");
                return;
            }
        };
        info!(group = %self.group, "transport consumer started");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => next,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    // 忽略单条错误，继续处理下一条
                    warn!(group = %self.group, error = %e, "transport stream error");
                    continue;
                }
                None => {
                    let e = TransportError::SubscriptionClosed {
                        group: self.group.clone(),
                    };
                    warn!(error = %e, "transport stream ended");
                    break;
                }
            };

            let (event, position) = message.into_event();
            let published = tokio::select! {
                _ = token.cancelled() => break,
                published = self.publisher.publish_tracked(event) => published,
            };
            match published {
                Ok(receipt) => {
                    if pending.send((receipt, position)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // 后续位点的提交会隐含覆盖本条，因此直接停止消费，等待重投
                    let e = TransportError::from(e);
                    info!(
                        group = %self.group,
                        %position,
                        error = %e,
                        "engine refused message, stop consuming"
                    );
                    break;
                }
            }
        }
        info!(group = %self.group, "transport consumer stopped");
    }

    async fn commit_loop(
        self: Arc<Self>,
        mut pending: mpsc::Receiver<(DeliveryReceipt, Position)>,
    ) {
        while let Some((receipt, position)) = pending.recv().await {
            match receipt.await {
                Ok(DispatchOutcome::Aborted) => {
                    warn!(group = %self.group, %position, "delivery aborted, commits halted");
                    break;
                }
                Ok(outcome) => {
                    if let Err(e) = self.source.commit(&self.group, &position).await {
                        warn!(group = %self.group, %position, error = %e, "commit failed");
                        continue;
                    }
                    debug!(group = %self.group, %position, ?outcome, "position committed");
                }
                Err(e) => {
                    warn!(
                        group = %self.group,
                        %position,
                        error = %e,
                        "delivery abandoned, commits halted"
                    );
                    break;
                }
            }
        }
    }
}

/// 消费者运行句柄
pub struct ConsumerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// 停止拉取新消息；已发布的消息仍会在完成后提交
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
