//! Change notification graph.
//!
//! Sources own a [`ChangeNotifier`]; dependents implement [`Observer`] and are
//! held weakly, so dropping a dependent removes its edge. Dispatch iterates a
//! snapshot of the subscriber list, which makes registering or unregistering
//! from inside `notify` well-defined: the change applies to the next dispatch.

use arc_swap::ArcSwap;
use std::{
    cell::Cell,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Identity of a notifying source. Notifications carry nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

static NEXT_SOURCE: AtomicU64 = AtomicU64::new(1);

pub trait Observer: Send + Sync {
    fn notify(&self, source: SourceId);
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    target: Weak<dyn Observer>,
}

impl Subscriber {
    fn points_to(&self, addr: *const ()) -> bool {
        Weak::as_ptr(&self.target) as *const () == addr
    }
}

struct SubscriberList {
    entries: ArcSwap<Vec<Subscriber>>,
}

impl SubscriberList {
    fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Subscriber>> {
        self.entries.load_full()
    }

    fn push(&self, subscriber: Subscriber) {
        self.entries.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(subscriber.clone());
            Arc::new(next)
        });
    }

    /// Drops every entry matching `pred`; returns how many went away.
    fn prune(&self, pred: impl Fn(&Subscriber) -> bool) -> usize {
        let removed = Cell::new(0usize);
        self.entries.rcu(|current| {
            let kept: Vec<_> = current.iter().filter(|sub| !pred(sub)).cloned().collect();
            removed.set(current.len() - kept.len());
            if kept.len() == current.len() {
                Arc::clone(current)
            } else {
                Arc::new(kept)
            }
        });
        removed.get()
    }
}

/// The outgoing edges of one source.
pub struct ChangeNotifier {
    source: SourceId,
    subscribers: SubscriberList,
    next_id: AtomicU64,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("source", &self.source)
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            source: SourceId(NEXT_SOURCE.fetch_add(1, Ordering::Relaxed)),
            subscribers: SubscriberList::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Adds an edge. Registering the same observer twice is a no-op and
    /// returns `false`.
    pub fn register<O: Observer + 'static>(&self, observer: &Arc<O>) -> bool {
        let addr = Arc::as_ptr(observer) as *const ();
        if self.snapshot_contains(addr) {
            return false;
        }
        let weak: Weak<O> = Arc::downgrade(observer);
        let target: Weak<dyn Observer> = weak;
        self.subscribers.push(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            target,
        });
        true
    }

    pub fn unregister<O: Observer + 'static>(&self, observer: &Arc<O>) -> bool {
        let addr = Arc::as_ptr(observer) as *const ();
        self.subscribers.prune(|sub| sub.points_to(addr)) > 0
    }

    pub fn is_registered<O: Observer + 'static>(&self, observer: &Arc<O>) -> bool {
        self.snapshot_contains(Arc::as_ptr(observer) as *const ())
    }

    /// Notifies every live observer; returns how many were reached.
    pub fn notify_all(&self) -> usize {
        let snapshot = self.subscribers.snapshot();
        if snapshot.is_empty() {
            return 0;
        }

        let mut delivered = 0usize;
        let mut stale = Vec::new();
        for subscriber in snapshot.iter() {
            match subscriber.target.upgrade() {
                Some(observer) => {
                    observer.notify(self.source);
                    delivered += 1;
                }
                None => stale.push(subscriber.id),
            }
        }

        if !stale.is_empty() {
            self.subscribers.prune(|sub| stale.contains(&sub.id));
        }
        delivered
    }

    pub fn has_observers(&self) -> bool {
        self.subscribers
            .snapshot()
            .iter()
            .any(|sub| sub.target.strong_count() > 0)
    }

    pub fn observer_count(&self) -> usize {
        self.subscribers
            .snapshot()
            .iter()
            .filter(|sub| sub.target.strong_count() > 0)
            .count()
    }

    fn snapshot_contains(&self, addr: *const ()) -> bool {
        self.subscribers
            .snapshot()
            .iter()
            .any(|sub| sub.points_to(addr) && sub.target.strong_count() > 0)
    }
}

/// Anything that owns a notifier.
pub trait Notifiable {
    fn notifier(&self) -> &ChangeNotifier;

    fn register<O: Observer + 'static>(&self, observer: &Arc<O>) -> bool
    where
        Self: Sized,
    {
        self.notifier().register(observer)
    }

    fn unregister<O: Observer + 'static>(&self, observer: &Arc<O>) -> bool
    where
        Self: Sized,
    {
        self.notifier().unregister(observer)
    }

    fn notify_all(&self) -> usize {
        self.notifier().notify_all()
    }

    fn has_observers(&self) -> bool {
        self.notifier().has_observers()
    }
}

/// Observer that only remembers that something upstream changed.
#[derive(Debug, Default)]
pub struct StaleFlag {
    stale: AtomicBool,
    last_source: AtomicU64,
}

impl StaleFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Reads and clears the flag.
    pub fn take(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }

    pub fn last_source(&self) -> Option<SourceId> {
        match self.last_source.load(Ordering::Acquire) {
            0 => None,
            raw => Some(SourceId(raw)),
        }
    }
}

impl Observer for StaleFlag {
    fn notify(&self, source: SourceId) {
        self.last_source.store(source.0, Ordering::Release);
        self.mark();
    }
}
