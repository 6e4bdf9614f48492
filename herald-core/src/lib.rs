//! 并发事件投递引擎（herald-core）
//!
//! 提供进程内事件投递的核心构件：
//! - 有界邮箱（`mailbox`）：FIFO、背压与未完成计数；
//! - 订阅注册表（`registry`）：事件类型 → 有序处理器列表；
//! - 去重守卫（`dedup`）：按消费组折叠至少一次传输带来的重复投递，保留策略可插拔；
//! - 分发器（`dispatcher`）：轮询邮箱，并发扇出到处理器，等待全部完成后再确认；
//! - 生命周期（`lifecycle`）：`Running → Draining → Stopped` 的优雅关闭；
//! - 引擎（`engine`）：以 builder 组装上述构件并返回运行句柄。
//!
//! 典型用法：
//! 1. 用 `EventEngine::builder()` 配置注册表、配置与（可选的）去重守卫；
//! 2. `start()` 得到 `EngineHandle`，通过 `subscribe` 注册处理器、`publish` 发布事件；
//! 3. 进程退出前调用 `stop()`，保证已入队的事件全部处理完毕。
//!
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod lifecycle;
pub mod mailbox;
pub mod registry;
pub mod report;

pub use config::EventEngineConfig;
pub use dedup::{ConsumerGroups, DedupGuard, DedupRetention};
pub use dispatcher::{DispatcherState, StatsSnapshot};
pub use engine::{EngineHandle, EventEngine};
pub use error::{BusError, BusResult, FailureKind, HandlerFailure};
pub use event::{DeliveryIdGenerator, Event};
pub use handler::{EventHandler, handler_fn};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use mailbox::{DeliveryReceipt, DispatchOutcome, PublishPolicy, Publisher};
pub use registry::SubscriptionRegistry;
pub use report::{FailureReporter, TracingReporter};
