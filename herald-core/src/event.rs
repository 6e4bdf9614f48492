//! 事件模型（Event）
//!
//! 事件由类型、负载与投递标识组成，创建后不可变：
//! - `event_type`：订阅路由的依据；
//! - `payload`：对引擎不透明的 JSON 负载；
//! - `delivery_id`：去重键。进程内发布时可由单调生成器产生，
//!   经由外部传输消费时由传输位点（如 topic + partition + offset）推导。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Mutex;
use ulid::{Generator, Ulid};

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct Event {
    /// 事件类型
    #[builder(into)]
    event_type: String,
    /// 事件负载
    #[builder(default)]
    payload: Value,
    /// 投递标识（去重键）
    #[builder(into, default = Ulid::new().to_string())]
    delivery_id: String,
    /// 事件创建时间
    #[builder(default = Utc::now())]
    occurred_at: DateTime<Utc>,
}

impl Event {
    /// 以随机 ULID 作为投递标识创建事件
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self::builder().event_type(event_type).payload(payload).build()
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// 单调递增的投递标识生成器
///
/// 同一毫秒内生成的 ULID 仍严格递增；由发布端持有，不做全局单例。
pub struct DeliveryIdGenerator {
    inner: Mutex<Generator>,
}

impl Default for DeliveryIdGenerator {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }
}

impl fmt::Debug for DeliveryIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryIdGenerator").finish_non_exhaustive()
    }
}

impl DeliveryIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let mut generator = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // 同一毫秒内随机部分溢出时退化为非单调 ULID
        match generator.generate() {
            Ok(id) => id.to_string(),
            Err(_) => Ulid::new().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_keeps_explicit_delivery_id() {
        let ev = Event::builder()
            .event_type("x")
            .delivery_id("abc")
            .payload(json!({"k": 1}))
            .build();
        assert_eq!(ev.event_type(), "x");
        assert_eq!(ev.delivery_id(), "abc");
        assert_eq!(ev.payload()["k"], 1);
    }

    #[test]
    fn generated_ids_are_monotonic() {
        let ids = DeliveryIdGenerator::new();
        let generated: Vec<String> = (0..256).map(|_| ids.next_id()).collect();
        let mut sorted = generated.clone();
        sorted.sort();
        assert_eq!(generated, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), 256);
    }
}
