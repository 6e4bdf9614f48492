//! 事件引擎配置
//!
//! 所有字段都有默认值；反序列化时缺省字段取默认值，时长以毫秒表示。
//!
use crate::error::{BusError, BusResult};
use crate::mailbox::PublishPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 事件引擎配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventEngineConfig {
    /// 邮箱容量（背压阈值）
    pub mailbox_capacity: usize,
    /// 分发器空闲时的轮询间隔，决定关闭信号的最大感知延迟
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// 容量满时的发布策略
    pub publish_policy: PublishPolicy,
    /// 单个处理器的执行超时，`None` 表示不限制
    #[serde(rename = "handler_timeout_ms", with = "option_duration_ms")]
    pub handler_timeout: Option<Duration>,
}

impl Default for EventEngineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            poll_interval: Duration::from_millis(500),
            publish_policy: PublishPolicy::Block,
            handler_timeout: None,
        }
    }
}

impl EventEngineConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.mailbox_capacity == 0 {
            return Err(BusError::invalid_config("mailbox_capacity must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(BusError::invalid_config("poll_interval must be > 0"));
        }
        if self.handler_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BusError::invalid_config("handler_timeout must be > 0"));
        }
        Ok(())
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
