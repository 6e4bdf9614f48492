use async_trait::async_trait;
use herald_core::{
    ConsumerGroups, DedupRetention, Event, EventEngine, EventEngineConfig, EventHandler,
    handler_fn,
};
use herald_transport::{InMemoryBroker, MessageSource, TransportConsumer};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct WelcomeMailer {
    sent: AtomicUsize,
}

#[async_trait]
impl EventHandler for WelcomeMailer {
    fn handler_name(&self) -> &str {
        "welcome_mailer"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let user = event.payload()["user_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing user_id"))?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        info!(user, delivery_id = %event.delivery_id(), "welcome mail sent");
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HERALD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mailer = Arc::new(WelcomeMailer {
        sent: AtomicUsize::new(0),
    });
    let audited = Arc::new(AtomicUsize::new(0));
    let audit = {
        let audited = audited.clone();
        handler_fn("audit_log", move |event: Arc<Event>| {
            let audited = audited.clone();
            async move {
                audited.fetch_add(1, Ordering::SeqCst);
                info!(event_type = %event.event_type(), "audit recorded");
                Ok(())
            }
        })
    };

    let groups = ConsumerGroups::new();
    let engine = EventEngine::builder()
        .config(EventEngineConfig {
            mailbox_capacity: 16,
            poll_interval: Duration::from_millis(100),
            ..Default::default()
        })
        .subscriptions([
            ("user.created", mailer.clone() as Arc<dyn EventHandler>),
            ("user.created", audit.clone()),
            ("user.deleted", audit),
        ])
        .dedup(groups.guard("onboarding", DedupRetention::Lru { capacity: 10_000 }))
        .build()
        .start()?;

    // 进程内发布
    let id = engine
        .emit("user.deleted", json!({ "user_id": "u-0" }))
        .await?;
    println!("emitted: {id}");

    // 经由至少一次传输的投递
    let broker = Arc::new(InMemoryBroker::new());
    let consumer = TransportConsumer::builder()
        .source(broker.clone() as Arc<dyn MessageSource>)
        .publisher(engine.publisher())
        .group("onboarding")
        .build()
        .start();

    for user in ["u-1", "u-2", "u-3"] {
        broker.produce("users", 0, "user.created", json!({ "user_id": user }));
    }
    // 确认超时前模拟一次重投
    let redelivered = broker.redeliver("onboarding");
    println!("redelivered: {redelivered} records");

    tokio::time::sleep(Duration::from_millis(200)).await;

    consumer.shutdown();
    engine.stop().await;
    consumer.join().await;

    println!("mails sent: {}", mailer.sent.load(Ordering::SeqCst));
    println!("audit entries: {}", audited.load(Ordering::SeqCst));
    println!(
        "committed offset: {:?}",
        broker.committed("onboarding", "users", 0)
    );
    println!("stats: {}", serde_json::to_string(&engine.stats())?);
    Ok(())
}
