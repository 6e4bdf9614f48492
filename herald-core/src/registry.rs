//! 订阅注册表（SubscriptionRegistry）
//!
//! 事件类型名 → 有序处理器列表。启动后以读为主；运行中注册是安全的，
//! 但与正在进行的分发决策只保证最终一致：中途注册的处理器可能收不到紧接着的下一个事件。
//!
use crate::handler::EventHandler;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_type: DashMap<String, Vec<Arc<dyn EventHandler>>>,
}

/// 按数据指针判断是否同一处理器实例（忽略 vtable）
fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加处理器；同一实例重复注册是幂等的，返回是否新增
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> bool {
        let mut list = self.by_type.entry(event_type.into()).or_default();
        if list.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// 移除处理器，返回是否存在
    pub fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let Some(mut list) = self.by_type.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !same_handler(h, handler));
        before != list.len()
    }

    /// 返回该类型处理器的快照；未注册时为空
    pub fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.by_type
            .get(event_type)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// 已有订阅的事件类型（只读视图）
    pub fn event_types(&self) -> Vec<String> {
        self.by_type
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::handler::handler_fn;

    fn noop(name: &str) -> Arc<dyn EventHandler> {
        handler_fn(name, |_ev: Arc<Event>| async { Ok(()) })
    }

    #[test]
    fn unknown_type_has_no_handlers() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.handlers_for("nothing").is_empty());
    }

    #[test]
    fn handlers_keep_registration_order() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("user.created", noop("h1"));
        registry.subscribe("user.created", noop("h2"));
        registry.subscribe("user.deleted", noop("h3"));

        let names: Vec<String> = registry
            .handlers_for("user.created")
            .iter()
            .map(|h| h.handler_name().to_string())
            .collect();
        assert_eq!(names, vec!["h1", "h2"]);
        assert_eq!(registry.handlers_for("user.deleted").len(), 1);
    }

    #[test]
    fn duplicate_subscription_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let h = noop("h");
        assert!(registry.subscribe("t", h.clone()));
        assert!(!registry.subscribe("t", h.clone()));
        assert_eq!(registry.handlers_for("t").len(), 1);

        // 同名但不同实例视为不同处理器
        assert!(registry.subscribe("t", noop("h")));
        assert_eq!(registry.handlers_for("t").len(), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_instance() {
        let registry = SubscriptionRegistry::new();
        let a = noop("a");
        let b = noop("b");
        registry.subscribe("t", a.clone());
        registry.subscribe("t", b.clone());

        assert!(registry.unsubscribe("t", &a));
        assert!(!registry.unsubscribe("t", &a));
        assert!(!registry.unsubscribe("other", &b));

        let left = registry.handlers_for("t");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].handler_name(), "b");
        assert_eq!(registry.event_types(), vec!["t".to_string()]);
    }
}
