//! Consumer-side controller over a single lease.
//!
//! A [`LiveQuery`] holds at most one lease at a time and swaps it as the
//! consumer's query, enabled flag or client changes. Observers registered
//! with [`LiveQuery::on_change`] hear about every data or status change of
//! whichever lease is current, and about the swaps themselves.

use crate::client::{ClientHandle, Unsubscribe};
use crate::registry::ViewRegistry;
use crate::types::{Query, Ttl};
use crate::views::{ResultDetails, SharedView, UpdateListener, ViewLease};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Options for a [`LiveQuery`].
#[derive(Clone, Debug, Default)]
pub struct LiveQueryOptions {
    /// Explicit sharing key passed to the registry.
    pub key: Option<String>,
    /// TTL applied to every lease this controller takes.
    pub ttl: Option<Ttl>,
}

struct Attached {
    lease: ViewLease,
    view: SharedView,
    detach: Unsubscribe,
}

impl Attached {
    fn release(self) {
        (self.detach)();
        self.lease.destroy();
    }
}

struct LiveState {
    query: Option<Query>,
    enabled: bool,
    attached: Option<Attached>,
    /// Data kept while no lease is attached.
    retained: Option<Value>,
    ttl: Option<Ttl>,
    destroyed: bool,
}

struct LiveInner {
    registry: ViewRegistry,
    client: ClientHandle,
    key: Option<String>,
    state: Mutex<LiveState>,
    observers: Mutex<Vec<(u64, UpdateListener)>>,
    next_observer: AtomicU64,
    client_watch: Mutex<Option<Unsubscribe>>,
}

impl LiveInner {
    fn notify(&self) {
        let observers: Vec<UpdateListener> =
            self.observers.lock().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            observer();
        }
    }

    fn attach(self: &Arc<Self>, query: &Query, ttl: Option<Ttl>) -> Attached {
        let lease = self
            .registry
            .lease(&self.client, query, true, self.key.as_deref());
        if let Some(ttl) = ttl {
            lease.update_ttl(ttl);
        }

        let weak: Weak<LiveInner> = Arc::downgrade(self);
        let detach = lease.add_update_listener(move || {
            if let Some(inner) = weak.upgrade() {
                inner.notify();
            }
        });
        let view = lease.shared().clone();
        Attached {
            lease,
            view,
            detach,
        }
    }

    /// Re-run subscription on the current lease, e.g. after a client change.
    fn refresh(&self) {
        let view = {
            let state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.attached.as_ref().map(|a| a.view.clone())
        };
        if let Some(view) = view {
            view.ensure_subscribed();
        }
        self.notify();
    }
}

/// Keeps a consumer attached to the view for its current query.
///
/// - enabled with a query: holds a lease on that query's shared view
/// - disabled: holds no lease, keeps the last data, reports `Unknown`
/// - no query: holds no lease, has no data
///
/// The lease for a new query is taken before the old one is released, so
/// switching between queries that share a view does not tear it down.
pub struct LiveQuery {
    inner: Arc<LiveInner>,
}

impl LiveQuery {
    pub fn new(
        registry: ViewRegistry,
        client: ClientHandle,
        query: Option<Query>,
        options: LiveQueryOptions,
    ) -> Self {
        let inner = Arc::new(LiveInner {
            registry,
            client,
            key: options.key,
            state: Mutex::new(LiveState {
                query: None,
                enabled: true,
                attached: None,
                retained: None,
                ttl: options.ttl,
                destroyed: false,
            }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            client_watch: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let watch = inner.client.on_change(move || {
            if let Some(inner) = weak.upgrade() {
                inner.refresh();
            }
        });
        *inner.client_watch.lock() = Some(watch);

        let live = Self { inner };
        live.update_query(query, true);
        live
    }

    /// Current data. `None` when there is no query.
    pub fn data(&self) -> Option<Value> {
        let state = self.inner.state.lock();
        match &state.attached {
            Some(attached) => Some(attached.view.data()),
            None => state.retained.clone(),
        }
    }

    /// Status of the current lease, `Unknown` when none is held.
    pub fn details(&self) -> ResultDetails {
        let state = self.inner.state.lock();
        match &state.attached {
            Some(attached) => attached.view.details(),
            None => ResultDetails::Unknown,
        }
    }

    pub fn query(&self) -> Option<Query> {
        self.inner.state.lock().query.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// True while a lease is held.
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().attached.is_some()
    }

    /// Switch to a new query or enabled flag.
    pub fn update_query(&self, query: Option<Query>, enabled: bool) {
        let ttl = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.query = query.clone();
            state.enabled = enabled;
            state.ttl
        };

        let next = match (&query, enabled) {
            (Some(query), true) => Some(self.inner.attach(query, ttl)),
            _ => None,
        };

        let previous = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                drop(state);
                if let Some(next) = next {
                    next.release();
                }
                return;
            }
            let previous = state.attached.take();
            state.retained = match (&query, &previous) {
                (None, _) => None,
                (Some(_), Some(previous)) if next.is_none() => Some(previous.view.data()),
                (Some(_), _) => state.retained.take(),
            };
            state.attached = next;
            previous
        };

        if let Some(previous) = previous {
            previous.release();
        }
        self.inner.notify();
    }

    /// Apply a TTL to the current lease and to every later one.
    pub fn set_ttl(&self, ttl: Ttl) {
        let view = {
            let mut state = self.inner.state.lock();
            state.ttl = Some(ttl);
            state.attached.as_ref().map(|a| a.view.clone())
        };
        if let Some(view) = view {
            view.update_ttl(ttl);
        }
    }

    /// Ask the current lease to subscribe and notify observers.
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    /// Observe changes. The returned callback detaches the observer.
    pub fn on_change<F>(&self, observer: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::SeqCst);
        self.inner.observers.lock().push((id, Arc::new(observer)));

        let weak = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.lock().retain(|(oid, _)| *oid != id);
            }
        })
    }

    /// Release the lease and stop watching the client. Idempotent.
    pub fn destroy(&self) {
        let attached = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.retained = None;
            state.attached.take()
        };

        if let Some(watch) = self.inner.client_watch.lock().take() {
            watch();
        }
        if let Some(attached) = attached {
            attached.release();
        }
        self.inner.observers.lock().clear();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LiveQuery")
            .field("query", &state.query)
            .field("enabled", &state.enabled)
            .field("attached", &state.attached.is_some())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
