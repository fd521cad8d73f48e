//! Leader-aware routing for client and forwarded traffic.
//!
//! A [`NodeSelector`] yields an ordered sequence of candidate servers on
//! each selection pass, parameterized by a [`SelectionStrategy`]. The
//! [`NodeSelectorManager`] owns the authoritative `(leader, servers)` pair
//! and resets every registered selector when the view changes.
//!
//! The manager's child set is copy-on-write: notification walks an
//! immutable snapshot, so selectors can register or remove themselves
//! concurrently without ever observing a partially updated set.

use common::NodeId;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

/// How a selector orders candidate servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// The current leader only; empty when none is known.
    Leader,
    /// Non-leader servers in roster order.
    Followers,
    /// Leader first, then followers.
    Any,
    /// Leader then followers; restarts the pass once on exhaustion.
    AnyWithFallback,
}

#[derive(Clone, Debug, Default)]
struct Routing {
    leader: Option<NodeId>,
    servers: Vec<NodeId>,
}

impl Routing {
    /// The candidate sequence for one selection pass.
    fn candidates(&self, strategy: SelectionStrategy) -> VecDeque<NodeId> {
        let mut queue = VecDeque::new();
        match strategy {
            SelectionStrategy::Leader => {
                if let Some(leader) = self.leader {
                    queue.push_back(leader);
                }
            }
            SelectionStrategy::Followers => {
                queue.extend(self.servers.iter().copied().filter(|s| Some(*s) != self.leader));
            }
            SelectionStrategy::Any | SelectionStrategy::AnyWithFallback => {
                if let Some(leader) = self.leader {
                    queue.push_back(leader);
                }
                queue.extend(self.servers.iter().copied().filter(|s| Some(*s) != self.leader));
            }
        }
        queue
    }
}

struct SelectorState {
    queue: VecDeque<NodeId>,
    /// Whether an `AnyWithFallback` pass has already restarted.
    retried: bool,
}

struct SelectorInner {
    strategy: SelectionStrategy,
    manager: Weak<ManagerInner>,
    state: Mutex<SelectorState>,
}

struct ManagerInner {
    routing: RwLock<Routing>,
    /// Copy-on-write child set: mutation replaces the Arc, iteration
    /// clones it.
    selectors: Mutex<Arc<Vec<Arc<SelectorInner>>>>,
}

impl ManagerInner {
    fn routing(&self) -> Routing {
        self.routing
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Owns the authoritative routing view and the registered selectors.
#[derive(Clone)]
pub struct NodeSelectorManager {
    inner: Arc<ManagerInner>,
}

impl Default for NodeSelectorManager {
    fn default() -> Self {
        Self::new(None, Vec::new())
    }
}

impl NodeSelectorManager {
    pub fn new(leader: Option<NodeId>, servers: Vec<NodeId>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                routing: RwLock::new(Routing { leader, servers }),
                selectors: Mutex::new(Arc::new(Vec::new())),
            }),
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.inner.routing().leader
    }

    pub fn servers(&self) -> Vec<NodeId> {
        self.inner.routing().servers
    }

    /// Create and register a selector with the given strategy.
    pub fn create_selector(&self, strategy: SelectionStrategy) -> NodeSelector {
        let routing = self.inner.routing();
        let selector = Arc::new(SelectorInner {
            strategy,
            manager: Arc::downgrade(&self.inner),
            state: Mutex::new(SelectorState {
                queue: routing.candidates(strategy),
                retried: false,
            }),
        });

        let mut set = lock(&self.inner.selectors);
        let mut next = Vec::with_capacity(set.len() + 1);
        next.extend(set.iter().cloned());
        next.push(Arc::clone(&selector));
        *set = Arc::new(next);

        NodeSelector { inner: selector }
    }

    /// Update the authoritative view and reset every registered selector.
    pub fn reset_all(&self, leader: Option<NodeId>, servers: Vec<NodeId>) {
        let routing = Routing { leader, servers };
        {
            let mut current = self
                .inner
                .routing
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = routing.clone();
        }

        // Walk an immutable snapshot; concurrent register/remove is fine.
        let snapshot = Arc::clone(&*lock(&self.inner.selectors));
        for selector in snapshot.iter() {
            selector.refill(&routing);
        }
    }

    /// Number of currently registered selectors.
    pub fn len(&self) -> usize {
        lock(&self.inner.selectors).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SelectorInner {
    fn refill(&self, routing: &Routing) {
        let mut state = lock(&self.state);
        state.queue = routing.candidates(self.strategy);
        state.retried = false;
    }
}

/// An ordered iterator over candidate servers.
pub struct NodeSelector {
    inner: Arc<SelectorInner>,
}

impl NodeSelector {
    pub fn strategy(&self) -> SelectionStrategy {
        self.inner.strategy
    }

    /// Restart the pass from the manager's current view.
    pub fn reset(&self) {
        if let Some(manager) = self.inner.manager.upgrade() {
            self.inner.refill(&manager.routing());
        }
    }

    /// Restart the pass from an explicit view, used when a send observes a
    /// routing hint fresher than the manager's.
    pub fn reset_with(&self, leader: Option<NodeId>, servers: Vec<NodeId>) {
        self.inner.refill(&Routing { leader, servers });
    }

    /// The next candidate, or `None` when the pass is exhausted.
    pub fn next(&self) -> Option<NodeId> {
        let mut state = lock(&self.inner.state);
        if let Some(node) = state.queue.pop_front() {
            return Some(node);
        }
        // A fallback pass restarts the iteration exactly once.
        if self.inner.strategy == SelectionStrategy::AnyWithFallback && !state.retried {
            state.retried = true;
            if let Some(manager) = self.inner.manager.upgrade() {
                state.queue = manager.routing().candidates(self.inner.strategy);
            }
            return state.queue.pop_front();
        }
        None
    }

    /// Deregister this selector from its manager.
    pub fn remove(&self) {
        let Some(manager) = self.inner.manager.upgrade() else {
            return;
        };
        let mut set = lock(&manager.selectors);
        let next: Vec<Arc<SelectorInner>> = set
            .iter()
            .filter(|s| !Arc::ptr_eq(s, &self.inner))
            .cloned()
            .collect();
        *set = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> NodeSelectorManager {
        NodeSelectorManager::new(Some(2), vec![1, 2, 3])
    }

    #[test]
    fn leader_strategy_yields_leader_only() {
        let selector = manager().create_selector(SelectionStrategy::Leader);
        assert_eq!(selector.next(), Some(2));
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn leader_strategy_empty_without_leader() {
        let manager = NodeSelectorManager::new(None, vec![1, 2, 3]);
        let selector = manager.create_selector(SelectionStrategy::Leader);
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn followers_strategy_skips_leader() {
        let selector = manager().create_selector(SelectionStrategy::Followers);
        assert_eq!(selector.next(), Some(1));
        assert_eq!(selector.next(), Some(3));
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn any_strategy_yields_leader_first() {
        let selector = manager().create_selector(SelectionStrategy::Any);
        let order: Vec<NodeId> = std::iter::from_fn(|| selector.next()).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn fallback_restarts_exactly_once() {
        let selector = manager().create_selector(SelectionStrategy::AnyWithFallback);
        let order: Vec<NodeId> = std::iter::from_fn(|| selector.next()).collect();
        assert_eq!(order, vec![2, 1, 3, 2, 1, 3]);
        // Exhausted for good after the single retry.
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn reset_all_updates_registered_selectors() {
        let manager = manager();
        let selector = manager.create_selector(SelectionStrategy::Leader);
        assert_eq!(selector.next(), Some(2));

        manager.reset_all(Some(3), vec![1, 2, 3]);
        assert_eq!(manager.leader(), Some(3));
        assert_eq!(selector.next(), Some(3));
    }

    #[test]
    fn reset_with_overrides_stale_view() {
        let manager = manager();
        let selector = manager.create_selector(SelectionStrategy::Any);
        selector.reset_with(Some(9), vec![9, 10]);
        assert_eq!(selector.next(), Some(9));
        assert_eq!(selector.next(), Some(10));
    }

    #[test]
    fn removed_selector_no_longer_notified() {
        let manager = manager();
        let kept = manager.create_selector(SelectionStrategy::Leader);
        let dropped = manager.create_selector(SelectionStrategy::Leader);
        assert_eq!(manager.len(), 2);

        dropped.remove();
        assert_eq!(manager.len(), 1);

        manager.reset_all(Some(1), vec![1, 2, 3]);
        assert_eq!(kept.next(), Some(1));
    }

    #[test]
    fn concurrent_registration_during_reset() {
        let manager = Arc::new(manager());

        let registrar = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let s = manager.create_selector(SelectionStrategy::Any);
                    s.remove();
                }
            })
        };
        let resetter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    manager.reset_all(Some(i % 3 + 1), vec![1, 2, 3]);
                }
            })
        };

        registrar.join().unwrap();
        resetter.join().unwrap();
        assert_eq!(manager.len(), 0);
    }
}
