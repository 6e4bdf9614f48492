//! 事件处理器（EventHandler）
//!
//! 处理器是注册在某一事件类型下的单方法能力；同一事件的多个处理器彼此独立执行，
//! 一个失败不会影响其他处理器。处理器需自行保证幂等或自行管理重试。
//!
use crate::event::Event;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于失败上报与日志）
    fn handler_name(&self) -> &str;
    /// 处理事件
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// 以闭包实现的处理器，见 [`handler_fn`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(Arc::new(event.clone())).await
    }
}

/// 将异步闭包包装为处理器
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
