//! 规则生命周期事件总线

use crate::models::Rule;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// 规则生命周期事件
#[derive(Debug, Clone, PartialEq)]
pub enum RuleEvent {
    RuleCreated {
        rule: Rule,
    },
    RuleUpdated {
        rule: Rule,
        previous: Rule,
    },
    RuleDeleted {
        rule_id: String,
        soft: bool,
        /// 删除前的规则
        rule: Option<Rule>,
    },
}

impl RuleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RuleCreated { .. } => EventKind::RuleCreated,
            Self::RuleUpdated { .. } => EventKind::RuleUpdated,
            Self::RuleDeleted { .. } => EventKind::RuleDeleted,
        }
    }

    pub fn rule_id(&self) -> &str {
        match self {
            Self::RuleCreated { rule } | Self::RuleUpdated { rule, .. } => &rule.id,
            Self::RuleDeleted { rule_id, .. } => rule_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RuleCreated,
    RuleUpdated,
    RuleDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleCreated => "ruleCreated",
            Self::RuleUpdated => "ruleUpdated",
            Self::RuleDeleted => "ruleDeleted",
        }
    }
}

type Handler = Arc<dyn Fn(&RuleEvent) -> anyhow::Result<()> + Send + Sync>;

struct SubscriberEntry {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
}

/// 发布/订阅总线
///
/// 订阅者的错误和 panic 只记录日志，不会影响发布方或其他订阅者。
#[derive(Clone, Default)]
pub struct SubscriberBus {
    inner: Arc<BusInner>,
}

impl SubscriberBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅指定类型的事件
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&RuleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push(SubscriberEntry {
            id,
            kind,
            handler: Arc::new(handler),
        });
        debug!(subscriber_id = id, kind = kind.as_str(), "新增事件订阅");

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 发布事件，返回成功处理的订阅者数量
    pub fn publish(&self, event: &RuleEvent) -> usize {
        let kind = event.kind();
        // 调用前释放读锁，订阅者内部可以再订阅或退订
        let handlers: Vec<(u64, Handler)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        subscriber_id = id,
                        kind = kind.as_str(),
                        rule_id = event.rule_id(),
                        error = %e,
                        "事件订阅者处理失败"
                    );
                }
                Err(_) => {
                    error!(
                        subscriber_id = id,
                        kind = kind.as_str(),
                        rule_id = event.rule_id(),
                        "事件订阅者发生 panic"
                    );
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// 订阅句柄，调用 `unsubscribe` 取消订阅
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 取消订阅，返回订阅是否仍然存在
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut subscribers = inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != self.id);
        subscribers.len() != before
    }
}
