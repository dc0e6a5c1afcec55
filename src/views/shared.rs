//! Shared view: one materialized subscription for one logical query.

use super::details::{QueryErrorDetails, ResultDetails, RetryHandle};
use crate::client::{ClientHandle, ClientView, Materialized, TtlControl, Unsubscribe};
use crate::types::{Emission, Query, ResultKind, Ttl};
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback run after every change to a view's data or status.
pub type UpdateListener = Arc<dyn Fn() + Send + Sync>;

/// The live client subscription owned by a view.
struct ActiveSubscription {
    view: Box<dyn ClientView>,
    ttl: Option<Arc<dyn TtlControl>>,
    remove_listener: Option<Unsubscribe>,
}

impl ActiveSubscription {
    fn teardown(mut self) {
        if let Some(remove) = self.remove_listener.take() {
            remove();
        }
        self.view.destroy();
    }
}

struct ViewState {
    subscription: Option<ActiveSubscription>,
    /// Latest emitted snapshot; `Null` before the first emission.
    snapshot: Value,
    details: ResultDetails,
    /// TTL requested before a subscription existed.
    pending_ttl: Option<Ttl>,
    /// TTL last applied, re-applied after a retry.
    applied_ttl: Option<Ttl>,
    materializing: bool,
    finalized: bool,
    /// Bumped on every retry; emissions from older subscriptions are ignored.
    generation: u64,
}

pub(crate) struct ViewInner {
    query: Query,
    client: ClientHandle,
    enabled: bool,
    state: Mutex<ViewState>,
    listeners: Mutex<Vec<(u64, UpdateListener)>>,
    next_listener: AtomicU64,
    /// Serializes fan-out so two emissions never interleave across listeners.
    delivery: ReentrantMutex<()>,
    this: Weak<ViewInner>,
}

impl ViewInner {
    fn materialize(&self) {
        if !self.enabled {
            return;
        }
        let Some(client) = self.client.current() else {
            tracing::trace!(table = self.query.table(), "client unavailable, deferring materialization");
            return;
        };

        let (generation, pending_ttl) = {
            let mut state = self.state.lock();
            if state.finalized || state.materializing || state.subscription.is_some() {
                return;
            }
            state.materializing = true;
            let pending_ttl = state.pending_ttl.take();
            // Recorded before the client runs so a retry from the first
            // emission carries it over.
            if pending_ttl.is_some() {
                state.applied_ttl = pending_ttl;
            }
            (state.generation, pending_ttl)
        };

        tracing::debug!(table = self.query.table(), generation, "materializing view");
        let Materialized { view, ttl } = client.materialize(&self.query);

        if let Some(pending) = pending_ttl {
            apply_ttl(ttl.as_ref(), pending);
        }

        let weak = self.this.clone();
        let remove = view.add_listener(Arc::new(move |emission: &Emission| {
            if let Some(inner) = weak.upgrade() {
                inner.on_emission(generation, emission);
            }
        }));

        let mut state = self.state.lock();
        state.materializing = false;

        if state.finalized || state.generation != generation {
            // Finalized or retried while the client was materializing.
            let rematerialize = !state.finalized;
            drop(state);
            remove();
            view.destroy();
            if rematerialize {
                self.materialize();
            }
            return;
        }

        let late_ttl = state.pending_ttl.take();
        if late_ttl.is_some() {
            state.applied_ttl = late_ttl;
        }
        state.subscription = Some(ActiveSubscription {
            view,
            ttl: ttl.clone(),
            remove_listener: Some(remove),
        });
        drop(state);

        if let Some(late) = late_ttl {
            apply_ttl(ttl.as_ref(), late);
        }
    }

    fn on_emission(&self, generation: u64, emission: &Emission) {
        let _gate = self.delivery.lock();
        {
            let mut state = self.state.lock();
            if state.finalized || state.generation != generation {
                return;
            }
            state.snapshot = emission.snapshot.clone();
            state.details = match emission.kind {
                ResultKind::Unknown => ResultDetails::Unknown,
                ResultKind::Complete => ResultDetails::Complete,
                ResultKind::Error => ResultDetails::Error(QueryErrorDetails::from_errored(
                    emission.error.as_ref(),
                    RetryHandle::new(self.this.clone(), generation),
                )),
            };
        }
        self.notify();
    }

    /// Run every update listener once, over a snapshot of the listener set.
    fn notify(&self) {
        let _gate = self.delivery.lock();
        let listeners: Vec<UpdateListener> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        tracing::trace!(table = self.query.table(), listeners = listeners.len(), "fan-out");
        for listener in listeners {
            listener();
        }
    }

    pub(crate) fn retry(&self, generation: u64) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if state.finalized || state.generation != generation {
                return false;
            }
            state.generation += 1;
            state.details = ResultDetails::Unknown;
            if state.pending_ttl.is_none() {
                state.pending_ttl = state.applied_ttl;
            }
            state.subscription.take()
        };

        tracing::debug!(table = self.query.table(), generation, "retrying view");
        if let Some(subscription) = previous {
            subscription.teardown();
        }
        self.notify();
        self.materialize();
        true
    }
}

impl Drop for ViewInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.state.get_mut().subscription.take() {
            subscription.teardown();
        }
    }
}

fn apply_ttl(control: Option<&Arc<dyn TtlControl>>, ttl: Ttl) {
    match control {
        Some(control) => {
            if let Err(e) = control.update_ttl(ttl) {
                tracing::debug!(error = %e, %ttl, "TTL update failed");
            }
        }
        None => tracing::trace!(%ttl, "view has no TTL control"),
    }
}

/// One materialized subscription shared by every lease on a query.
///
/// Cloning a `SharedView` clones the handle, not the view.
#[derive(Clone)]
pub struct SharedView {
    inner: Arc<ViewInner>,
}

impl SharedView {
    /// Create a view. Nothing is materialized until [`ensure_subscribed`].
    ///
    /// [`ensure_subscribed`]: SharedView::ensure_subscribed
    pub fn new(query: Query, client: ClientHandle, enabled: bool) -> Self {
        let inner = Arc::new_cyclic(|this| ViewInner {
            query,
            client,
            enabled,
            state: Mutex::new(ViewState {
                subscription: None,
                snapshot: Value::Null,
                details: ResultDetails::Unknown,
                pending_ttl: None,
                applied_ttl: None,
                materializing: false,
                finalized: false,
                generation: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            delivery: ReentrantMutex::new(()),
            this: this.clone(),
        });
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ViewInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ViewInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// True while a client subscription is held.
    pub fn is_materialized(&self) -> bool {
        self.inner.state.lock().subscription.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.state.lock().finalized
    }

    /// Materialize if enabled, not yet materialized, and the client is
    /// available. Otherwise a no-op; call again once the client appears.
    pub fn ensure_subscribed(&self) {
        self.inner.materialize();
    }

    /// Register a listener run after every data or status change.
    pub fn add_update_listener<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let weak = self.downgrade();
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Forward a TTL to the subscription, or hold it until one exists.
    /// Failures are logged and otherwise ignored.
    pub fn update_ttl(&self, ttl: Ttl) {
        let control = {
            let mut state = self.inner.state.lock();
            let control = match state.subscription.as_ref() {
                Some(subscription) => subscription.ttl.clone(),
                None => {
                    state.pending_ttl = Some(ttl);
                    return;
                }
            };
            state.applied_ttl = Some(ttl);
            control
        };
        apply_ttl(control.as_ref(), ttl);
    }

    /// TTL waiting for the first materialization.
    pub fn pending_ttl(&self) -> Option<Ttl> {
        self.inner.state.lock().pending_ttl
    }

    /// Tear down the subscription and drop all update listeners.
    /// Safe to call repeatedly and on views that never materialized.
    pub fn finalize(&self) {
        let subscription = {
            let mut state = self.inner.state.lock();
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.subscription.take()
        };

        if let Some(subscription) = subscription {
            tracing::debug!(table = self.inner.query.table(), "tearing down view");
            subscription.teardown();
        }
        self.inner.listeners.lock().clear();
    }

    /// Latest snapshot, or an empty array before the first emission.
    pub fn data(&self) -> Value {
        match &self.inner.state.lock().snapshot {
            Value::Null => Value::Array(Vec::new()),
            snapshot => snapshot.clone(),
        }
    }

    pub fn details(&self) -> ResultDetails {
        self.inner.state.lock().details.clone()
    }

    /// Data and details read under one lock.
    pub fn current(&self) -> (Value, ResultDetails) {
        let state = self.inner.state.lock();
        let data = match &state.snapshot {
            Value::Null => Value::Array(Vec::new()),
            snapshot => snapshot.clone(),
        };
        (data, state.details.clone())
    }

    /// True if both handles point at the same view.
    pub fn ptr_eq(&self, other: &SharedView) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharedView")
            .field("query", &self.inner.query)
            .field("enabled", &self.inner.enabled)
            .field("materialized", &state.subscription.is_some())
            .field("finalized", &state.finalized)
            .field("status", &state.details.kind())
            .finish()
    }
}
