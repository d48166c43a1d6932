//! Synchronous fan-out of snapshots to registered observers.
//!
//! Observers are notified in registration order, inside the dispatch that
//! produced the change. Membership of a notification pass is fixed when the
//! pass starts: observers added mid-pass wait for the next one, observers
//! removed mid-pass still finish the current one.
//!
//! A failing observer is reported and counted, never allowed to stop the
//! rest of the pass.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use thiserror::Error;

use crate::presence::Snapshot;

/// Something that wants to see every new snapshot.
pub trait PresenceObserver {
    fn on_snapshot(&mut self, snapshot: &Arc<Snapshot>) -> Result<(), ObserverError>;

    /// Label used when reporting failures.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Adapter that lets a closure act as an observer.
struct FnObserver<F> {
    f: F,
}

impl<F> PresenceObserver for FnObserver<F>
where
    F: FnMut(&Arc<Snapshot>) -> Result<(), ObserverError>,
{
    fn on_snapshot(&mut self, snapshot: &Arc<Snapshot>) -> Result<(), ObserverError> {
        (self.f)(snapshot)
    }
}

/// Error returned by an observer callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ObserverError {
    message: String,
}

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ObserverError {
    fn from(e: std::io::Error) -> Self {
        Self::new(format!("I/O error: {e}"))
    }
}

/// Registration handle id. Ids are never reused within a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One observer failing during one notification pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Observer {observer} ({name}) failed on snapshot v{version}: {error}")]
pub struct ObserverFailure {
    pub observer: ObserverId,
    pub name: String,
    /// Version of the snapshot being delivered.
    pub version: u64,
    pub error: ObserverError,
}

/// Result of one notification pass.
#[derive(Debug, Clone, Default)]
pub struct NotifyReport {
    pub delivered: usize,
    pub failures: Vec<ObserverFailure>,
}

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub notifications_sent: u64,
    pub observer_failures: u64,
    pub active_observers: usize,
}

#[derive(Clone)]
struct Entry {
    id: ObserverId,
    observer: Rc<RefCell<dyn PresenceObserver>>,
}

struct HubInner {
    entries: RefCell<Vec<Entry>>,
    next_id: Cell<u64>,
    notifications_sent: Cell<u64>,
    observer_failures: Cell<u64>,
}

impl HubInner {
    fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        before != entries.len()
    }
}

/// Ordered observer registry owned by a presence store.
pub struct SubscriptionHub {
    inner: Rc<HubInner>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(HubInner {
                entries: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
                notifications_sent: Cell::new(0),
                observer_failures: Cell::new(0),
            }),
        }
    }

    /// Register an observer at the end of the notification order.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: PresenceObserver + 'static,
    {
        let id = ObserverId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);

        let observer: Rc<RefCell<dyn PresenceObserver>> = Rc::new(RefCell::new(observer));
        self.inner.entries.borrow_mut().push(Entry { id, observer });
        log::debug!("Observer {id} subscribed");

        Subscription {
            id,
            hub: Some(Rc::downgrade(&self.inner)),
        }
    }

    /// Register a closure as an observer.
    pub fn subscribe_fn<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&Arc<Snapshot>) -> Result<(), ObserverError> + 'static,
    {
        self.subscribe(FnObserver { f })
    }

    /// Deliver a snapshot to every observer registered when the pass starts.
    pub(crate) fn notify(&self, snapshot: &Arc<Snapshot>) -> NotifyReport {
        // Clone the list so observers can (un)subscribe while we iterate.
        let entries: Vec<Entry> = self.inner.entries.borrow().clone();
        let mut report = NotifyReport::default();

        for entry in entries {
            let result = match entry.observer.try_borrow_mut() {
                Ok(mut observer) => observer
                    .on_snapshot(snapshot)
                    .map_err(|error| (observer.name().to_string(), error)),
                Err(_) => Err((
                    "busy".to_string(),
                    ObserverError::new("observer is already running"),
                )),
            };

            match result {
                Ok(()) => {
                    report.delivered += 1;
                    self.inner
                        .notifications_sent
                        .set(self.inner.notifications_sent.get() + 1);
                }
                Err((name, error)) => {
                    let failure = ObserverFailure {
                        observer: entry.id,
                        name,
                        version: snapshot.version(),
                        error,
                    };
                    log::warn!("{failure}");
                    self.inner
                        .observer_failures
                        .set(self.inner.observer_failures.get() + 1);
                    report.failures.push(failure);
                }
            }
        }

        report
    }

    pub fn observer_count(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            notifications_sent: self.inner.notifications_sent.get(),
            observer_failures: self.inner.observer_failures.get(),
            active_observers: self.observer_count(),
        }
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration token. Dropping it unregisters the observer, so early
/// returns and `?` paths release it too.
#[must_use = "dropping a Subscription unregisters the observer immediately"]
pub struct Subscription {
    id: ObserverId,
    hub: Option<Weak<HubInner>>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Whether the observer is still registered.
    pub fn is_active(&self) -> bool {
        let Some(hub) = self.hub.as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        let registered = hub.entries.borrow().iter().any(|e| e.id == self.id);
        registered
    }

    /// Unregister now. Takes effect before the next notification pass.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the observer registered for the lifetime of the hub.
    pub fn detach(mut self) {
        self.hub = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.take().and_then(|weak| weak.upgrade()) {
            if hub.remove(self.id) {
                log::debug!("Observer {} unsubscribed", self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("detached", &self.hub.is_none())
            .finish()
    }
}
