//! 内存版消息中间件（InMemoryBroker）
//!
//! 满足 `MessageSource` 协议的“至少一次”实现，用于测试、示例与本地开发：
//! - 每个 (topic, partition) 一条只追加日志；
//! - 每个消费组独立记录已提交位点（下一条待消费的 offset）；
//! - `subscribe` 先回放该组未提交的记录，再接收新写入的记录；
//! - `redeliver` 把某组未提交的记录重新推送给其订阅者，模拟确认超时后的重投。
//!
use crate::error::{TransportError, TransportResult};
use crate::message::{Position, TransportMessage};
use crate::source::MessageSource;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

type Subscriber = mpsc::UnboundedSender<TransportResult<TransportMessage>>;

#[derive(Clone)]
struct Record {
    event_type: String,
    payload: Value,
}

#[derive(Default)]
struct Inner {
    logs: BTreeMap<(String, u32), Vec<Record>>,
    subscribers: Vec<(String, Subscriber)>,
}

#[derive(Default)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
    committed: DashMap<(String, String, u32), u64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条记录并推送给所有订阅者，返回其位点
    pub fn produce(
        &self,
        topic: impl Into<String>,
        partition: u32,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Position {
        let topic = topic.into();
        let record = Record {
            event_type: event_type.into(),
            payload,
        };

        let mut inner = self.lock();
        let log = inner.logs.entry((topic.clone(), partition)).or_default();
        let position = Position::new(topic, partition, log.len() as u64);
        log.push(record.clone());

        let message = TransportMessage::new(position.clone(), record.event_type, record.payload);
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(Ok(message.clone())).is_ok());
        position
    }

    /// 把该组未提交的记录重新推送给它的订阅者，返回推送条数
    pub fn redeliver(&self, group: &str) -> usize {
        let mut inner = self.lock();
        let backlog = self.backlog(&inner, group);
        let mut pushed = 0;
        inner.subscribers.retain(|(g, tx)| {
            if g != group {
                return true;
            }
            for message in &backlog {
                if tx.send(Ok(message.clone())).is_err() {
                    return false;
                }
                pushed += 1;
            }
            true
        });
        debug!(group, pushed, "redelivered uncommitted records");
        pushed
    }

    /// 该组在某分区上的已提交位点（下一条待消费的 offset）
    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|v| *v)
    }

    pub fn log_len(&self, topic: &str, partition: u32) -> usize {
        self.lock()
            .logs
            .get(&(topic.to_string(), partition))
            .map_or(0, Vec::len)
    }

    fn backlog(&self, inner: &Inner, group: &str) -> Vec<TransportMessage> {
        let mut out = Vec::new();
        for ((topic, partition), log) in &inner.logs {
            let from = self.committed(group, topic, *partition).unwrap_or(0);
            for (offset, record) in log.iter().enumerate().skip(from as usize) {
                out.push(TransportMessage::new(
                    Position::new(topic.clone(), *partition, offset as u64),
                    record.event_type.clone(),
                    record.payload.clone(),
                ));
            }
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn subscribe(
        &self,
        group: &str,
    ) -> TransportResult<BoxStream<'static, TransportResult<TransportMessage>>> {
        let (tx, rx) = mpsc::unbounded_channel();

        // 回放与登记在同一把锁内完成，避免漏掉并发写入
        let mut inner = self.lock();
        for message in self.backlog(&inner, group) {
            tx.send(Ok(message)).map_err(|e| TransportError::Broker {
                reason: e.to_string(),
            })?;
        }
        inner.subscribers.push((group.to_string(), tx));
        drop(inner);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn commit(&self, group: &str, position: &Position) -> TransportResult<()> {
        let next = position.offset() + 1;
        self.committed
            .entry((
                group.to_string(),
                position.topic().to_string(),
                position.partition(),
            ))
            .and_modify(|v| *v = (*v).max(next))
            .or_insert(next);
        Ok(())
    }
}
