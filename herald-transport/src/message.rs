//! 传输消息与位点
//!
//! 位点（topic + partition + offset）在同一个消费组内唯一标识一次投递，
//! 转换为 `Event` 时据此推导 `delivery_id`，重投的消息因此拥有相同的去重键。
//!
use herald_core::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    topic: String,
    partition: u32,
    offset: u64,
}

impl Position {
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// 去重键：`topic:partition:offset`
    pub fn delivery_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMessage {
    position: Position,
    event_type: String,
    payload: Value,
}

impl TransportMessage {
    pub fn new(position: Position, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            position,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// 转换为引擎事件，保留位点用于之后提交
    pub fn into_event(self) -> (Event, Position) {
        let event = Event::builder()
            .event_type(self.event_type)
            .payload(self.payload)
            .delivery_id(self.position.delivery_id())
            .build();
        (event, self.position)
    }
}
