//! Presence store: the authoritative snapshot of active cluster nodes.
//!
//! ## Architecture
//!
//! ```text
//! PresenceEvent
//!       │
//!       ▼
//! PresenceStore::dispatch()
//!       │  reduce(&current, &event)   (pure)
//!       ▼
//! Snapshot v(n+1)  ── unchanged membership? ──► dropped, no notification
//!       │
//!       ▼
//! SubscriptionHub::notify()  (synchronous, registration order)
//! ```
//!
//! The store is single-threaded by construction (`Rc`/`RefCell`, no locks).
//! Every published [`Snapshot`] is immutable and shared as an `Arc`, so
//! observers can detect change by pointer identity and may hand snapshots
//! to other threads.

use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::broadcast::{HubStats, ObserverError, PresenceObserver, Subscription, SubscriptionHub};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Opaque node identifier. Sole identity key for a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::borrow::Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One cluster member as asserted by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Free-form role label.
    pub kind: String,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

/// Normalized instruction to the store.
///
/// Every variant reduces to a new complete [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PresenceEvent {
    /// The feed asserts the whole active set. Order is display order;
    /// duplicate ids resolve last-write-wins.
    ReplaceActiveSet { nodes: Vec<Node> },
    /// Add one node, or update its kind if already present.
    NodeJoined(Node),
    /// Remove one node. Unknown ids are a no-op.
    NodeLeft(NodeId),
}

impl PresenceEvent {
    pub fn replace(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self::ReplaceActiveSet {
            nodes: nodes.into_iter().collect(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Snapshot
// ───────────────────────────────────────────────────────────────────

/// Immutable view of the active node set at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    version: u64,
    /// Nodes in order of first appearance.
    nodes: Vec<Node>,
    /// id → position in `nodes`.
    index: HashMap<NodeId, usize>,
}

impl Snapshot {
    /// The empty snapshot every store starts from (version 0).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from nodes in order. A repeated id replaces the
    /// earlier entry in place.
    pub fn from_nodes(version: u64, nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut snapshot = Self {
            version,
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        for node in nodes {
            match snapshot.index.get(&node.id) {
                Some(&pos) => snapshot.nodes[pos] = node,
                None => {
                    snapshot.index.insert(node.id.clone(), snapshot.nodes.len());
                    snapshot.nodes.push(node);
                }
            }
        }
        snapshot
    }

    /// Monotonic version; bumps once per applied change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Active nodes in display order.
    pub fn active_nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&pos| &self.nodes[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }

    /// Same id set and same kind for every id. Order and version are ignored.
    pub fn same_membership(&self, other: &Snapshot) -> bool {
        self.len() == other.len()
            && self
                .nodes
                .iter()
                .all(|node| other.get(node.id.as_str()).is_some_and(|o| o.kind == node.kind))
    }

    /// Membership changes from `previous` to `self`.
    pub fn diff(&self, previous: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        for node in &self.nodes {
            match previous.get(node.id.as_str()) {
                None => diff.joined.push(node.id.clone()),
                Some(old) if old.kind != node.kind => diff.rekinded.push(node.id.clone()),
                Some(_) => {}
            }
        }
        diff.left = previous
            .ids()
            .filter(|id| !self.contains(id.as_str()))
            .cloned()
            .collect();
        diff
    }
}

/// Result of [`Snapshot::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub joined: Vec<NodeId>,
    pub left: Vec<NodeId>,
    /// Present in both, with a different kind.
    pub rekinded: Vec<NodeId>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.rekinded.is_empty()
    }
}

/// Apply one event to a snapshot. Pure: no I/O, no hidden state.
///
/// The result always carries `current.version() + 1`; deciding whether the
/// result is a real change is the store's job.
pub fn reduce(current: &Snapshot, event: &PresenceEvent) -> Snapshot {
    let version = current.version + 1;
    match event {
        PresenceEvent::ReplaceActiveSet { nodes } => {
            Snapshot::from_nodes(version, nodes.iter().cloned())
        }
        PresenceEvent::NodeJoined(node) => Snapshot::from_nodes(
            version,
            current.nodes.iter().cloned().chain(std::iter::once(node.clone())),
        ),
        PresenceEvent::NodeLeft(id) => Snapshot::from_nodes(
            version,
            current.nodes.iter().filter(|n| &n.id != id).cloned(),
        ),
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// What happened to a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new snapshot was published and observers were notified.
    Changed { version: u64 },
    /// The event produced the same membership; nothing was published.
    Unchanged,
    /// Dispatched from inside an observer; applied after the current pass.
    Queued,
}

struct StoreInner {
    current: RefCell<Arc<Snapshot>>,
    hub: SubscriptionHub,
    pending: RefCell<VecDeque<PresenceEvent>>,
    dispatching: Cell<bool>,
}

/// Single-writer presence store.
///
/// Cloning yields another handle to the same store. An observer that needs
/// to dispatch follow-up events should hold a [`WeakPresenceStore`] instead:
/// the hub owns its observers, so a strong handle inside one keeps the store
/// alive for as long as that observer stays registered, and forever once
/// its subscription is detached.
#[derive(Clone)]
pub struct PresenceStore {
    inner: Rc<StoreInner>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(StoreInner {
                current: RefCell::new(Arc::new(Snapshot::empty())),
                hub: SubscriptionHub::new(),
                pending: RefCell::new(VecDeque::new()),
                dispatching: Cell::new(false),
            }),
        }
    }

    /// Apply an event and notify observers if the membership changed.
    ///
    /// Calls made while a notification pass is running are queued and
    /// applied in order once the pass completes.
    pub fn dispatch(&self, event: PresenceEvent) -> DispatchOutcome {
        if self.inner.dispatching.get() {
            let mut pending = self.inner.pending.borrow_mut();
            pending.push_back(event);
            log::trace!("Queued re-entrant dispatch ({} pending)", pending.len());
            return DispatchOutcome::Queued;
        }

        let _guard = DispatchGuard::enter(&self.inner.dispatching, &self.inner.pending);
        let outcome = self.apply(event);

        loop {
            // Release the queue borrow before applying; observers may enqueue more.
            let next = self.inner.pending.borrow_mut().pop_front();
            match next {
                Some(event) => {
                    self.apply(event);
                }
                None => break,
            }
        }

        outcome
    }

    fn apply(&self, event: PresenceEvent) -> DispatchOutcome {
        let current = Arc::clone(&*self.inner.current.borrow());
        let next = reduce(&current, &event);

        if next.same_membership(&current) {
            log::trace!("Dispatch left snapshot v{} unchanged", current.version());
            return DispatchOutcome::Unchanged;
        }

        let version = next.version();
        let next = Arc::new(next);
        *self.inner.current.borrow_mut() = Arc::clone(&next);
        log::debug!("Snapshot v{version}: {} active nodes", next.len());

        let report = self.inner.hub.notify(&next);
        if !report.failures.is_empty() {
            log::debug!(
                "Snapshot v{version} delivered to {} observers, {} failed",
                report.delivered,
                report.failures.len()
            );
        }

        DispatchOutcome::Changed { version }
    }

    /// Current snapshot. Never blocks, never fails.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.inner.current.borrow())
    }

    /// Register an observer. Dropping the returned token unregisters it.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: PresenceObserver + 'static,
    {
        self.inner.hub.subscribe(observer)
    }

    /// Register a closure as an observer.
    pub fn subscribe_fn<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&Arc<Snapshot>) -> Result<(), ObserverError> + 'static,
    {
        self.inner.hub.subscribe_fn(f)
    }

    pub fn hub_stats(&self) -> HubStats {
        self.inner.hub.stats()
    }

    /// Whether a notification pass is running right now.
    pub fn is_dispatching(&self) -> bool {
        self.inner.dispatching.get()
    }

    /// Handle that does not keep the store alive.
    pub fn downgrade(&self) -> WeakPresenceStore {
        WeakPresenceStore {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Non-owning store handle for observers that dispatch.
#[derive(Clone)]
pub struct WeakPresenceStore {
    inner: Weak<StoreInner>,
}

impl WeakPresenceStore {
    pub fn upgrade(&self) -> Option<PresenceStore> {
        self.inner.upgrade().map(|inner| PresenceStore { inner })
    }

    /// Dispatch if the store still exists. `None` once it has been dropped.
    pub fn dispatch(&self, event: PresenceEvent) -> Option<DispatchOutcome> {
        self.upgrade().map(|store| store.dispatch(event))
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the dispatching flag even if an observer panics. Events queued by
/// an aborted pass are discarded rather than applied by the next dispatch.
struct DispatchGuard<'a> {
    flag: &'a Cell<bool>,
    pending: &'a RefCell<VecDeque<PresenceEvent>>,
}

impl<'a> DispatchGuard<'a> {
    fn enter(flag: &'a Cell<bool>, pending: &'a RefCell<VecDeque<PresenceEvent>>) -> Self {
        flag.set(true);
        Self { flag, pending }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
        if let Ok(mut pending) = self.pending.try_borrow_mut() {
            if !pending.is_empty() {
                log::warn!("Discarding {} queued events from an aborted dispatch", pending.len());
                pending.clear();
            }
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn n(id: &str, kind: &str) -> Node {
        Node::new(id, kind)
    }

    fn recorder(store: &PresenceStore) -> (Rc<RefCell<Vec<u64>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let sub = store.subscribe_fn(move |s: &Arc<Snapshot>| {
            sink.borrow_mut().push(s.version());
            Ok(())
        });
        (seen, sub)
    }

    // ── Snapshot / reduce ────────────────────────────────────────

    #[test]
    fn test_from_nodes_preserves_order() {
        let s = Snapshot::from_nodes(1, vec![n("b", "x"), n("a", "y"), n("c", "z")]);
        let ids: Vec<&str> = s.ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn test_duplicate_id_last_write_wins() {
        let s = reduce(
            &Snapshot::empty(),
            &PresenceEvent::replace(vec![n("n1", "x"), n("n2", "q"), n("n1", "y")]),
        );
        assert_eq!(s.len(), 2);
        assert_eq!(s.get("n1").unwrap().kind, "y");
        // Keeps the position of the first occurrence.
        assert_eq!(s.active_nodes()[0].id.as_str(), "n1");
    }

    #[test]
    fn test_reduce_is_pure() {
        let base = Snapshot::from_nodes(4, vec![n("a", "x")]);
        let event = PresenceEvent::replace(vec![n("b", "y")]);
        let r1 = reduce(&base, &event);
        let r2 = reduce(&base, &event);
        assert_eq!(r1, r2);
        assert_eq!(r1.version(), 5);
        // Input untouched.
        assert!(base.contains("a"));
    }

    #[test]
    fn test_reduce_join_and_leave() {
        let s1 = reduce(&Snapshot::empty(), &PresenceEvent::NodeJoined(n("a", "x")));
        let s2 = reduce(&s1, &PresenceEvent::NodeJoined(n("b", "y")));
        let s3 = reduce(&s2, &PresenceEvent::NodeJoined(n("a", "z")));
        assert_eq!(s3.get("a").unwrap().kind, "z");
        assert_eq!(s3.active_nodes()[0].id.as_str(), "a");

        let s4 = reduce(&s3, &PresenceEvent::NodeLeft(NodeId::from("a")));
        assert!(!s4.contains("a"));
        assert!(s4.contains("b"));

        let s5 = reduce(&s4, &PresenceEvent::NodeLeft(NodeId::from("missing")));
        assert!(s5.same_membership(&s4));
    }

    #[test]
    fn test_same_membership_ignores_order() {
        let a = Snapshot::from_nodes(1, vec![n("a", "x"), n("b", "y")]);
        let b = Snapshot::from_nodes(2, vec![n("b", "y"), n("a", "x")]);
        assert!(a.same_membership(&b));

        let c = Snapshot::from_nodes(3, vec![n("a", "x"), n("b", "changed")]);
        assert!(!a.same_membership(&c));

        let d = Snapshot::from_nodes(3, vec![n("a", "x")]);
        assert!(!a.same_membership(&d));
    }

    #[test]
    fn test_diff() {
        let prev = Snapshot::from_nodes(1, vec![n("a", "x"), n("b", "y"), n("c", "z")]);
        let next = Snapshot::from_nodes(2, vec![n("b", "y"), n("c", "w"), n("d", "v")]);
        let diff = next.diff(&prev);
        assert_eq!(diff.joined, vec![NodeId::from("d")]);
        assert_eq!(diff.left, vec![NodeId::from("a")]);
        assert_eq!(diff.rekinded, vec![NodeId::from("c")]);
        assert!(next.diff(&next).is_empty());
    }

    // ── Store ────────────────────────────────────────────────────

    #[test]
    fn test_empty_initial_state() {
        let store = PresenceStore::new();
        let s = store.snapshot();
        assert!(s.is_empty());
        assert_eq!(s.version(), 0);
    }

    #[test]
    fn test_replace_is_complete() {
        let store = PresenceStore::new();
        store.dispatch(PresenceEvent::replace(vec![n("A", "x"), n("B", "x")]));
        store.dispatch(PresenceEvent::replace(vec![n("C", "x")]));

        let s = store.snapshot();
        let ids: Vec<&str> = s.ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["C"]);
    }

    #[test]
    fn test_idempotent_dispatch() {
        let store = PresenceStore::new();
        let (seen, _sub) = recorder(&store);
        let event = PresenceEvent::replace(vec![n("a", "x"), n("b", "y")]);

        assert_eq!(store.dispatch(event.clone()), DispatchOutcome::Changed { version: 1 });
        let first = store.snapshot();

        assert_eq!(store.dispatch(event), DispatchOutcome::Unchanged);
        let second = store.snapshot();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*seen.borrow(), vec![1]);
    }

    #[test]
    fn test_kind_change_notifies() {
        let store = PresenceStore::new();
        let (seen, _sub) = recorder(&store);

        store.dispatch(PresenceEvent::replace(vec![n("a", "x")]));
        store.dispatch(PresenceEvent::replace(vec![n("a", "y")]));
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(store.snapshot().get("a").unwrap().kind, "y");
    }

    #[test]
    fn test_empty_replace_on_empty_store_is_noop() {
        let store = PresenceStore::new();
        let (seen, _sub) = recorder(&store);
        assert_eq!(store.dispatch(PresenceEvent::replace(vec![])), DispatchOutcome::Unchanged);
        assert!(seen.borrow().is_empty());
        assert_eq!(store.snapshot().version(), 0);
    }

    #[test]
    fn test_order_preserved_across_dispatches() {
        let store = PresenceStore::new();
        let (seen, _sub) = recorder(&store);

        store.dispatch(PresenceEvent::replace(vec![n("a", "x")]));
        store.dispatch(PresenceEvent::replace(vec![n("b", "x")]));
        store.dispatch(PresenceEvent::replace(vec![n("c", "x")]));
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reentrant_dispatch_is_queued() {
        let store = PresenceStore::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handle = store.downgrade();
        let first_log = log.clone();
        let _first = store.subscribe_fn(move |s: &Arc<Snapshot>| {
            first_log.borrow_mut().push(format!("first:v{}", s.version()));
            if s.contains("seed") && !s.contains("echo") {
                let outcome = handle.dispatch(PresenceEvent::NodeJoined(Node::new("echo", "x")));
                assert_eq!(outcome, Some(DispatchOutcome::Queued));
            }
            Ok(())
        });

        let second_log = log.clone();
        let _second = store.subscribe_fn(move |s: &Arc<Snapshot>| {
            second_log.borrow_mut().push(format!("second:v{}", s.version()));
            Ok(())
        });

        let outcome = store.dispatch(PresenceEvent::replace(vec![n("seed", "x")]));
        assert_eq!(outcome, DispatchOutcome::Changed { version: 1 });

        // The queued event lands only after the first pass finished.
        assert_eq!(
            *log.borrow(),
            vec!["first:v1", "second:v1", "first:v2", "second:v2"]
        );
        assert!(store.snapshot().contains("echo"));
        assert!(!store.is_dispatching());
    }

    #[test]
    fn test_failed_observer_keeps_snapshot() {
        let store = PresenceStore::new();
        let _bad = store.subscribe_fn(|_: &Arc<Snapshot>| Err(ObserverError::new("render failed")));

        let outcome = store.dispatch(PresenceEvent::replace(vec![n("a", "x")]));
        assert_eq!(outcome, DispatchOutcome::Changed { version: 1 });
        assert!(store.snapshot().contains("a"));
        assert_eq!(store.hub_stats().observer_failures, 1);
    }

    #[test]
    fn test_clone_shares_state() {
        let store = PresenceStore::new();
        let other = store.clone();
        other.dispatch(PresenceEvent::replace(vec![n("a", "x")]));
        assert!(store.snapshot().contains("a"));
    }

    #[test]
    fn test_panicking_observer_drops_queued_events() {
        let store = PresenceStore::new();
        let handle = store.downgrade();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let _sub = store.subscribe_fn(move |_: &Arc<Snapshot>| {
            if !flag.get() {
                flag.set(true);
                handle.dispatch(PresenceEvent::NodeJoined(n("stray", "x")));
                panic!("observer blew up");
            }
            Ok(())
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.dispatch(PresenceEvent::replace(vec![n("a", "x")]))
        }));
        assert!(result.is_err());
        assert!(fired.get());
        assert!(!store.is_dispatching());

        store.dispatch(PresenceEvent::replace(vec![n("b", "x")]));
        let s = store.snapshot();
        assert!(s.contains("b"));
        assert!(!s.contains("stray"));
        assert_eq!(s.version(), 2);
    }

    #[test]
    fn test_weak_handle_does_not_keep_store_alive() {
        let store = PresenceStore::new();
        let weak = store.downgrade();
        let handle = weak.clone();
        store
            .subscribe_fn(move |s: &Arc<Snapshot>| {
                if !s.contains("follow-up") {
                    handle.dispatch(PresenceEvent::NodeJoined(n("follow-up", "x")));
                }
                Ok(())
            })
            .detach();

        store.dispatch(PresenceEvent::replace(vec![n("a", "x")]));
        assert!(store.snapshot().contains("follow-up"));

        drop(store);
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.dispatch(PresenceEvent::replace(vec![])), None);
    }
}
