use async_trait::async_trait;
use herald_core::{
    ConsumerGroups, DedupRetention, Event, EventEngine, EventEngineConfig, EventHandler,
};
use herald_transport::{InMemoryBroker, MessageSource, TransportConsumer};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

fn fast_config() -> EventEngineConfig {
    EventEngineConfig {
        mailbox_capacity: 8,
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

#[derive(Clone, Default)]
struct Counter {
    calls: Arc<AtomicUsize>,
    ids: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler for Counter {
    fn handler_name(&self) -> &str {
        "counter"
    }
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ids.lock().unwrap().push(event.delivery_id().to_string());
        Ok(())
    }
}

/// 直到拿到许可才返回
struct Blocking {
    release: Semaphore,
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for Blocking {
    fn handler_name(&self) -> &str {
        "blocking"
    }
    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.acquire().await?.forget();
        Ok(())
    }
}

/// 条件轮询，超时后返回最后一次的结果
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn committed_messages_are_not_redelivered() {
    let broker = Arc::new(InMemoryBroker::new());
    let groups = ConsumerGroups::new();
    let counter = Counter::default();

    let engine = EventEngine::builder()
        .config(fast_config())
        .dedup(groups.guard("mailer", DedupRetention::Lru { capacity: 1024 }))
        .build()
        .start()
        .unwrap();
    engine.subscribe("x", Arc::new(counter.clone()));

    let consumer = TransportConsumer::builder()
        .source(broker.clone() as Arc<dyn MessageSource>)
        .publisher(engine.publisher())
        .group("mailer")
        .build()
        .start();

    broker.produce("events", 0, "x", json!({"to": "u-1"}));
    assert!(wait_until(|| broker.committed("mailer", "events", 0) == Some(1)).await);

    // 已提交的位点不会再被重投
    assert_eq!(broker.redeliver("mailer"), 0);

    consumer.shutdown();
    engine.stop().await;
    consumer.join().await;

    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*counter.ids.lock().unwrap(), vec!["events:0:0".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn uncommitted_redelivery_is_suppressed_by_dedup() {
    let broker = Arc::new(InMemoryBroker::new());
    let groups = ConsumerGroups::new();
    let blocking = Arc::new(Blocking {
        release: Semaphore::new(0),
        calls: AtomicUsize::new(0),
    });

    let engine = EventEngine::builder()
        .config(fast_config())
        .dedup(groups.guard("billing", DedupRetention::Unbounded))
        .build()
        .start()
        .unwrap();
    engine.subscribe("x", blocking.clone());

    let consumer = TransportConsumer::builder()
        .source(broker.clone() as Arc<dyn MessageSource>)
        .publisher(engine.publisher())
        .group("billing")
        .build()
        .start();

    broker.produce("events", 0, "x", json!({"deliveryId": "abc"}));
    assert!(wait_until(|| blocking.calls.load(Ordering::SeqCst) == 1).await);

    // 处理尚未完成，位点未提交，中间件重投
    assert_eq!(broker.committed("billing", "events", 0), None);
    assert_eq!(broker.redeliver("billing"), 1);
    assert!(wait_until(|| engine.outstanding() == 2).await);

    blocking.release.add_permits(1);
    assert!(wait_until(|| engine.stats().duplicates == 1).await);
    assert!(wait_until(|| broker.committed("billing", "events", 0) == Some(1)).await);

    consumer.shutdown();
    engine.stop().await;
    consumer.join().await;

    assert_eq!(blocking.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().dispatched, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn backlog_is_replayed_and_groups_are_independent() {
    let broker = Arc::new(InMemoryBroker::new());
    for i in 0..3 {
        broker.produce("orders", 0, "order.placed", json!({ "n": i }));
    }
    broker.produce("orders", 1, "order.placed", json!({ "n": 3 }));

    let groups = ConsumerGroups::new();
    let mut counters = Vec::new();
    let mut running = Vec::new();
    for group in ["billing", "audit"] {
        let counter = Counter::default();
        let engine = EventEngine::builder()
            .config(fast_config())
            .dedup(groups.guard(group, DedupRetention::Unbounded))
            .build()
            .start()
            .unwrap();
        engine.subscribe("order.placed", Arc::new(counter.clone()));
        let consumer = TransportConsumer::builder()
            .source(broker.clone() as Arc<dyn MessageSource>)
            .publisher(engine.publisher())
            .group(group)
            .build()
            .start();
        counters.push(counter);
        running.push((engine, consumer));
    }

    for group in ["billing", "audit"] {
        assert!(wait_until(|| broker.committed(group, "orders", 0) == Some(3)).await);
        assert!(wait_until(|| broker.committed(group, "orders", 1) == Some(1)).await);
    }

    for (engine, consumer) in running {
        consumer.shutdown();
        engine.stop().await;
        consumer.join().await;
    }
    for counter in counters {
        assert_eq!(counter.calls.load(Ordering::SeqCst), 4);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn commits_wait_for_handlers_to_finish() {
    let broker = Arc::new(InMemoryBroker::new());
    let blocking = Arc::new(Blocking {
        release: Semaphore::new(0),
        calls: AtomicUsize::new(0),
    });
    let engine = EventEngine::builder()
        .config(fast_config())
        .build()
        .start()
        .unwrap();
    engine.subscribe("x", blocking.clone());
    let consumer = TransportConsumer::builder()
        .source(broker.clone() as Arc<dyn MessageSource>)
        .publisher(engine.publisher())
        .group("g")
        .build()
        .start();

    broker.produce("t", 0, "x", json!({}));
    broker.produce("t", 0, "x", json!({}));
    assert!(wait_until(|| blocking.calls.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.committed("g", "t", 0), None);

    blocking.release.add_permits(1);
    assert!(wait_until(|| broker.committed("g", "t", 0) == Some(1)).await);

    blocking.release.add_permits(1);
    assert!(wait_until(|| broker.committed("g", "t", 0) == Some(2)).await);

    consumer.shutdown();
    engine.stop().await;
    consumer.join().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn aborted_delivery_is_left_for_redelivery() {
    let broker = Arc::new(InMemoryBroker::new());
    let groups = ConsumerGroups::new();
    let blocking = Arc::new(Blocking {
        release: Semaphore::new(0),
        calls: AtomicUsize::new(0),
    });
    let engine = EventEngine::builder()
        .config(fast_config())
        .dedup(groups.guard("g", DedupRetention::Unbounded))
        .build()
        .start()
        .unwrap();
    engine.subscribe("x", blocking.clone());
    let consumer = TransportConsumer::builder()
        .source(broker.clone() as Arc<dyn MessageSource>)
        .publisher(engine.publisher())
        .group("g")
        .build()
        .start();

    broker.produce("t", 0, "x", json!({}));
    assert!(wait_until(|| blocking.calls.load(Ordering::SeqCst) == 1).await);

    consumer.shutdown();
    assert!(engine.stop_within(Duration::from_millis(50)).await.is_err());
    consumer.join().await;
    assert_eq!(broker.committed("g", "t", 0), None);

    // 中止的条目不占用组内的去重记录
    assert!(groups.get("g").unwrap().is_empty());

    // 同组的新消费者从未提交的位点重新开始
    let counter = Counter::default();
    let engine = EventEngine::builder()
        .config(fast_config())
        .dedup(groups.guard("g", DedupRetention::Unbounded))
        .build()
        .start()
        .unwrap();
    engine.subscribe("x", Arc::new(counter.clone()));
    let consumer = TransportConsumer::builder()
        .source(broker.clone() as Arc<dyn MessageSource>)
        .publisher(engine.publisher())
        .group("g")
        .build()
        .start();
    assert!(wait_until(|| broker.committed("g", "t", 0) == Some(1)).await);

    consumer.shutdown();
    engine.stop().await;
    consumer.join().await;
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().duplicates, 0);
}
