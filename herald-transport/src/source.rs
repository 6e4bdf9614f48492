//! 消息源（MessageSource）协议
//!
//! 抽象一个按消费组提供“至少一次”投递的外部传输（消息中间件或内存实现）：
//! - `subscribe`：返回 `'static` 生命周期的消息流，从该组已提交位点之后开始；
//! - `commit`：提交位点，表示该位点及之前的消息已被完整处理。
//!
use crate::error::TransportResult;
use crate::message::{Position, TransportMessage};
use async_trait::async_trait;
use futures_core::stream::BoxStream;

#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn subscribe(
        &self,
        group: &str,
    ) -> TransportResult<BoxStream<'static, TransportResult<TransportMessage>>>;

    async fn commit(&self, group: &str, position: &Position) -> TransportResult<()>;
}
