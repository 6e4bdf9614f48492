//! 失败上报（FailureReporter）
//!
//! 处理器失败只会交给上报器（日志、指标、死信等），不会回传给发布者，
//! 也不会自动重试。
//!
use crate::error::HandlerFailure;
use async_trait::async_trait;

#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report(&self, failure: &HandlerFailure);
}

/// 默认上报器：输出一条 `warn` 级别的结构化日志
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

#[async_trait]
impl FailureReporter for TracingReporter {
    async fn report(&self, failure: &HandlerFailure) {
        tracing::warn!(
            handler = %failure.handler,
            event_type = %failure.event_type,
            delivery_id = %failure.delivery_id,
            kind = %failure.kind,
            reason = %failure.reason,
            "event handler failed"
        );
    }
}
