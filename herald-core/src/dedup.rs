//! 去重守卫（DedupGuard）
//!
//! 记录已处理过的投递标识，把传输层的“至少一次”收敛为处理器视角的“至多一次”。
//! 作用域为一个消费组；同组的多个分发器共享同一个守卫（见 `ConsumerGroups`）。
//!
//! 保留策略可插拔，避免长驻进程中已见集合无限增长：
//! - `Unbounded`：不淘汰（仅适用于短生命周期或有界输入）；
//! - `Lru { capacity }`：超出容量时淘汰最久未见的标识，重复命中会刷新；
//! - `Window { ttl }`：首次见到后 `ttl` 内视为重复，过期即遗忘。
//!
//! 被淘汰的标识再次到达时会被重新处理，这是内存与正确性之间的显式取舍。
//!
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// 保留策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DedupRetention {
    Unbounded,
    Lru {
        capacity: usize,
    },
    Window {
        #[serde(rename = "ttl_ms", with = "crate::config::duration_ms")]
        ttl: Duration,
    },
}

impl Default for DedupRetention {
    fn default() -> Self {
        DedupRetention::Lru { capacity: 100_000 }
    }
}

enum Seen {
    Unbounded(std::collections::HashSet<String>),
    Lru {
        capacity: usize,
        tick: u64,
        stamps: HashMap<String, u64>,
        order: BTreeMap<u64, String>,
    },
    Window {
        ttl: Duration,
        first_seen: HashMap<String, Instant>,
        order: VecDeque<(Instant, String)>,
    },
}

impl Seen {
    fn new(retention: DedupRetention) -> Self {
        match retention {
            DedupRetention::Unbounded => Seen::Unbounded(Default::default()),
            DedupRetention::Lru { capacity } => Seen::Lru {
                capacity: capacity.max(1),
                tick: 0,
                stamps: HashMap::new(),
                order: BTreeMap::new(),
            },
            DedupRetention::Window { ttl } => Seen::Window {
                ttl,
                first_seen: HashMap::new(),
                order: VecDeque::new(),
            },
        }
    }

    /// 首次见到返回 true 并记录
    fn record(&mut self, id: &str) -> bool {
        match self {
            Seen::Unbounded(set) => set.insert(id.to_string()),
            Seen::Lru {
                capacity,
                tick,
                stamps,
                order,
            } => {
                *tick += 1;
                if let Some(prev) = stamps.insert(id.to_string(), *tick) {
                    order.remove(&prev);
                    order.insert(*tick, id.to_string());
                    return false;
                }
                order.insert(*tick, id.to_string());
                while stamps.len() > *capacity {
                    let Some((_, oldest)) = order.pop_first() else {
                        break;
                    };
                    stamps.remove(&oldest);
                }
                true
            }
            Seen::Window {
                ttl,
                first_seen,
                order,
            } => {
                let now = Instant::now();
                while let Some((at, _)) = order.front() {
                    if now.duration_since(*at) < *ttl {
                        break;
                    }
                    if let Some((at, old)) = order.pop_front() {
                        // 仅当记录仍是这一条时才移除
                        if first_seen.get(&old) == Some(&at) {
                            first_seen.remove(&old);
                        }
                    }
                }
                if first_seen.contains_key(id) {
                    return false;
                }
                first_seen.insert(id.to_string(), now);
                order.push_back((now, id.to_string()));
                true
            }
        }
    }

    fn forget(&mut self, id: &str) -> bool {
        match self {
            Seen::Unbounded(set) => set.remove(id),
            Seen::Lru { stamps, order, .. } => match stamps.remove(id) {
                Some(stamp) => {
                    order.remove(&stamp);
                    true
                }
                None => false,
            },
            // 队列中的旧条目在清理时按时间戳比对，留着无害
            Seen::Window { first_seen, .. } => first_seen.remove(id).is_some(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Seen::Unbounded(set) => set.len(),
            Seen::Lru { stamps, .. } => stamps.len(),
            Seen::Window { first_seen, .. } => first_seen.len(),
        }
    }
}

/// 去重守卫，内部自带同步，可在多个分发器间共享
pub struct DedupGuard {
    group: String,
    retention: DedupRetention,
    seen: Mutex<Seen>,
}

impl std::fmt::Debug for DedupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupGuard")
            .field("group", &self.group)
            .field("retention", &self.retention)
            .field("len", &self.len())
            .finish()
    }
}

impl DedupGuard {
    pub fn new(group: impl Into<String>, retention: DedupRetention) -> Self {
        Self {
            group: group.into(),
            retention,
            seen: Mutex::new(Seen::new(retention)),
        }
    }

    /// 首次见到时原子地记录并返回 true；保留期内再次见到返回 false
    pub fn should_process(&self, delivery_id: &str) -> bool {
        self.lock().record(delivery_id)
    }

    /// 撤销一条记录，使该标识下次到达时重新处理
    ///
    /// 用于处理器未能完整执行的条目（强制关闭时被中止），返回记录是否存在。
    pub fn forget(&self, delivery_id: &str) -> bool {
        self.lock().forget(delivery_id)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn retention(&self) -> DedupRetention {
        self.retention
    }

    /// 当前保留的标识数量
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Seen> {
        // 记录过程不会在持锁时 panic 出半成品状态，直接沿用
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 消费组 → 共享去重守卫
#[derive(Default)]
pub struct ConsumerGroups {
    guards: DashMap<String, Arc<DedupGuard>>,
}

impl ConsumerGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取组的守卫；不存在时以 `retention` 创建。已存在时忽略 `retention`。
    pub fn guard(&self, group: &str, retention: DedupRetention) -> Arc<DedupGuard> {
        self.guards
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(DedupGuard::new(group, retention)))
            .clone()
    }

    pub fn get(&self, group: &str) -> Option<Arc<DedupGuard>> {
        self.guards.get(group).map(|g| g.clone())
    }

    /// 已注册的消费组（只读视图）
    pub fn groups(&self) -> Vec<String> {
        self.guards.iter().map(|e| e.key().clone()).collect()
    }
}
