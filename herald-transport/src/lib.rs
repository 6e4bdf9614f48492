//! 外部传输接入（herald-transport）
//!
//! 把按消费组提供“至少一次”投递的消息源接入 `herald-core` 事件引擎：
//! - `MessageSource`：订阅与位点提交协议；
//! - `InMemoryBroker`：内存实现，支持回放与重投；
//! - `TransportConsumer`：消息 → 事件，完成后再提交位点。
//!
//! 关闭顺序：先 `ConsumerHandle::shutdown` 停止拉取，再 `EngineHandle::stop` 排空，
//! 最后 `ConsumerHandle::join` 等待剩余位点提交完毕。
//!
pub mod consumer;
pub mod error;
pub mod inmemory_broker;
pub mod message;
pub mod source;

pub use consumer::{ConsumerHandle, TransportConsumer};
pub use error::{TransportError, TransportResult};
pub use inmemory_broker::InMemoryBroker;
pub use message::{Position, TransportMessage};
pub use source::MessageSource;
