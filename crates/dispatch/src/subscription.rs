//! Trigger subscriptions, indexed by event kind.

use parley_core::capability::Trigger;
use parley_core::event::EventKind;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Default trigger priority.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Opaque token returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Discovery view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub handle: SubscriptionHandle,
    pub kind: EventKind,

    /// Extension owning the trigger
    pub owner: String,

    /// Registered trigger capability name
    pub capability: String,

    /// Higher runs first
    pub priority: i32,
}

#[derive(Clone)]
pub(crate) struct Subscription {
    pub info: SubscriptionInfo,
    pub trigger: Arc<dyn Trigger>,
}

/// Per-kind subscription lists, each kept sorted by priority descending,
/// then by subscription order.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    next: AtomicU64,
    by_kind: RwLock<BTreeMap<EventKind, Vec<Subscription>>>,
}

impl SubscriptionTable {
    pub fn insert(
        &self,
        kind: EventKind,
        owner: &str,
        capability: &str,
        trigger: Arc<dyn Trigger>,
        priority: i32,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        let subscription = Subscription {
            info: SubscriptionInfo {
                handle,
                kind: kind.clone(),
                owner: owner.to_string(),
                capability: capability.to_string(),
                priority,
            },
            trigger,
        };

        let mut by_kind = self.by_kind.write().unwrap_or_else(|e| e.into_inner());
        let list = by_kind.entry(kind).or_default();
        // Handles grow monotonically, so equal priorities stay in subscription order.
        let at = list.partition_point(|s| s.info.priority >= priority);
        list.insert(at, subscription);
        handle
    }

    pub fn remove(&self, handle: SubscriptionHandle) -> Option<SubscriptionInfo> {
        let mut by_kind = self.by_kind.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = None;
        for list in by_kind.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.info.handle == handle) {
                removed = Some(list.remove(pos).info);
                break;
            }
        }
        by_kind.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn remove_owner(&self, owner: &str) -> usize {
        let mut by_kind = self.by_kind.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for list in by_kind.values_mut() {
            let before = list.len();
            list.retain(|s| s.info.owner != owner);
            removed += before - list.len();
        }
        by_kind.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn snapshot(&self, kind: &EventKind) -> Vec<Subscription> {
        self.by_kind
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, kind: &EventKind) -> bool {
        self.by_kind
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(kind)
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.by_kind
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flat_map(|list| list.iter().map(|s| s.info.clone()))
            .collect()
    }
}
