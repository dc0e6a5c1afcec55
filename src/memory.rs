//! In-process sync client.
//!
//! `MemoryClient` implements [`SyncClient`] without any network. Emissions
//! and connection changes are driven by hand, and every call the broker
//! makes is counted, which makes it the client used by tests and benches.

use crate::client::{
    ClientView, ConnectionListener, ConnectionMonitor, EmissionListener, Materialized,
    PendingPreload, SyncClient, TtlControl, Unsubscribe,
};
use crate::error::ClientError;
use crate::types::{ConnectionState, Emission, PreloadOptions, Query, RunOptions, Ttl};
use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A materialized view inside [`MemoryClient`].
pub struct MemoryView {
    id: u64,
    query: Query,
    listeners: Mutex<Vec<(u64, EmissionListener)>>,
    next_listener: AtomicU64,
    last: Mutex<Option<Emission>>,
    destroyed: AtomicBool,
    destroy_calls: AtomicUsize,
    ttl_updates: Mutex<Vec<Ttl>>,
    fail_ttl: AtomicBool,
    /// Destroy counter of the owning client.
    client_destroys: Arc<AtomicUsize>,
}

impl MemoryView {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Deliver an emission to every listener. Ignored once destroyed.
    pub fn emit(&self, emission: Emission) {
        if self.is_destroyed() {
            return;
        }
        *self.last.lock() = Some(emission.clone());

        let listeners: Vec<EmissionListener> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&emission);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of times `destroy` was called.
    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// TTL values received, in order.
    pub fn ttl_updates(&self) -> Vec<Ttl> {
        self.ttl_updates.lock().clone()
    }

    /// Make subsequent TTL updates fail.
    pub fn fail_ttl_updates(&self, fail: bool) {
        self.fail_ttl.store(fail, Ordering::SeqCst);
    }
}

impl TtlControl for MemoryView {
    fn update_ttl(&self, ttl: Ttl) -> Result<(), ClientError> {
        self.ttl_updates.lock().push(ttl);
        if self.fail_ttl.load(Ordering::SeqCst) {
            return Err(ClientError::new("TTL update rejected"));
        }
        Ok(())
    }
}

struct ViewRef(Arc<MemoryView>);

impl ClientView for ViewRef {
    fn add_listener(&self, listener: EmissionListener) -> Unsubscribe {
        let view = &self.0;
        let id = view.next_listener.fetch_add(1, Ordering::SeqCst);
        view.listeners.lock().push((id, listener.clone()));

        // Deliver the current result synchronously, as a real client does.
        let current = view.last.lock().clone();
        if let Some(emission) = current {
            listener(&emission);
        }

        let weak: Weak<MemoryView> = Arc::downgrade(view);
        Box::new(move || {
            if let Some(view) = weak.upgrade() {
                view.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    fn destroy(&self) {
        self.0.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.0.client_destroys.fetch_add(1, Ordering::SeqCst);
        self.0.destroyed.store(true, Ordering::SeqCst);
        self.0.listeners.lock().clear();
    }
}

/// Connection monitor backed by a settable state.
pub struct MemoryConnection {
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<(u64, ConnectionListener)>>,
    next_listener: AtomicU64,
    this: Weak<MemoryConnection>,
}

impl MemoryConnection {
    fn new(initial: ConnectionState) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    fn set(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let listeners: Vec<ConnectionListener> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(state);
        }
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl ConnectionMonitor for MemoryConnection {
    fn current(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn subscribe(&self, listener: ConnectionListener) -> Unsubscribe {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, listener));

        let weak = self.this.clone();
        Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }
}

/// Sync client that lives entirely in memory.
pub struct MemoryClient {
    views: Mutex<Vec<Arc<MemoryView>>>,
    next_view: AtomicU64,
    keep_history: bool,
    materialized: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
    supports_ttl: bool,
    initial: Option<Emission>,
    connection: Option<Arc<MemoryConnection>>,
    run_result: Mutex<Result<Value, ClientError>>,
    run_calls: Mutex<Vec<(Query, RunOptions)>>,
    preload_error: Mutex<Option<ClientError>>,
    preload_outcome: Mutex<Result<(), ClientError>>,
    preload_calls: AtomicUsize,
    preload_cleanups: Arc<AtomicUsize>,
}

impl MemoryClient {
    /// Create a client with TTL support and a connected monitor.
    pub fn new() -> Self {
        Self {
            views: Mutex::new(Vec::new()),
            next_view: AtomicU64::new(1),
            keep_history: true,
            materialized: AtomicUsize::new(0),
            destroyed: Arc::new(AtomicUsize::new(0)),
            supports_ttl: true,
            initial: None,
            connection: Some(MemoryConnection::new(ConnectionState::Connecting)),
            run_result: Mutex::new(Ok(Value::Array(Vec::new()))),
            run_calls: Mutex::new(Vec::new()),
            preload_error: Mutex::new(None),
            preload_outcome: Mutex::new(Ok(())),
            preload_calls: AtomicUsize::new(0),
            preload_cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Views materialized by this client have no TTL control.
    pub fn without_ttl(mut self) -> Self {
        self.supports_ttl = false;
        self
    }

    /// The client has no connection monitor.
    pub fn without_connection(mut self) -> Self {
        self.connection = None;
        self
    }

    /// Forget destroyed views instead of keeping them for inspection.
    /// Counters still cover every view; `views()` lists only live ones.
    pub fn without_history(mut self) -> Self {
        self.keep_history = false;
        self
    }

    /// Every new view starts with this emission, delivered as soon as a
    /// listener is added.
    pub fn with_initial(mut self, emission: Emission) -> Self {
        self.initial = Some(emission);
        self
    }

    // --- Views ---

    /// All views ever materialized, oldest first. Without history, only
    /// views that were live at the last materialization are kept.
    pub fn views(&self) -> Vec<Arc<MemoryView>> {
        self.views.lock().clone()
    }

    pub fn latest_view(&self) -> Option<Arc<MemoryView>> {
        self.views.lock().last().cloned()
    }

    /// Views that have not been destroyed.
    pub fn live_views(&self) -> Vec<Arc<MemoryView>> {
        self.views
            .lock()
            .iter()
            .filter(|v| !v.is_destroyed())
            .cloned()
            .collect()
    }

    pub fn materialize_count(&self) -> usize {
        self.materialized.load(Ordering::SeqCst)
    }

    /// Total `destroy` calls across all views.
    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Emit on every live view of the given table.
    pub fn emit_to(&self, table: &str, emission: Emission) {
        for view in self.live_views() {
            if view.query().table() == table {
                view.emit(emission.clone());
            }
        }
    }

    // --- Connection ---

    pub fn set_connection_state(&self, state: ConnectionState) {
        if let Some(conn) = &self.connection {
            conn.set(state);
        }
    }

    pub fn connection_listener_count(&self) -> usize {
        self.connection
            .as_ref()
            .map(|c| c.listener_count())
            .unwrap_or(0)
    }

    // --- One-shot operations ---

    pub fn set_run_result(&self, result: Result<Value, ClientError>) {
        *self.run_result.lock() = result;
    }

    /// Queries passed to `run`, in call order.
    pub fn run_calls(&self) -> Vec<(Query, RunOptions)> {
        self.run_calls.lock().clone()
    }

    /// Make `preload` reject synchronously.
    pub fn set_preload_error(&self, error: Option<ClientError>) {
        *self.preload_error.lock() = error;
    }

    /// Outcome of the completion future of later preloads.
    pub fn set_preload_outcome(&self, outcome: Result<(), ClientError>) {
        *self.preload_outcome.lock() = outcome;
    }

    pub fn preload_count(&self) -> usize {
        self.preload_calls.load(Ordering::SeqCst)
    }

    pub fn preload_cleanup_count(&self) -> usize {
        self.preload_cleanups.load(Ordering::SeqCst)
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncClient for MemoryClient {
    fn materialize(&self, query: &Query) -> Materialized {
        let view = Arc::new(MemoryView {
            id: self.next_view.fetch_add(1, Ordering::SeqCst),
            query: query.clone(),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            last: Mutex::new(self.initial.clone()),
            destroyed: AtomicBool::new(false),
            destroy_calls: AtomicUsize::new(0),
            ttl_updates: Mutex::new(Vec::new()),
            fail_ttl: AtomicBool::new(false),
            client_destroys: self.destroyed.clone(),
        });
        self.materialized.fetch_add(1, Ordering::SeqCst);
        {
            let mut views = self.views.lock();
            if !self.keep_history {
                views.retain(|v| !v.is_destroyed());
            }
            views.push(view.clone());
        }

        let ttl: Option<Arc<dyn TtlControl>> = if self.supports_ttl {
            Some(view.clone())
        } else {
            None
        };

        Materialized {
            view: Box::new(ViewRef(view)),
            ttl,
        }
    }

    fn connection(&self) -> Option<&dyn ConnectionMonitor> {
        self.connection
            .as_deref()
            .map(|c| c as &dyn ConnectionMonitor)
    }

    fn run(&self, query: &Query, options: RunOptions) -> BoxFuture<'static, Result<Value, ClientError>> {
        self.run_calls.lock().push((query.clone(), options));
        future::ready(self.run_result.lock().clone()).boxed()
    }

    fn preload(
        &self,
        _query: &Query,
        _options: PreloadOptions,
    ) -> Result<PendingPreload, ClientError> {
        if let Some(error) = self.preload_error.lock().clone() {
            return Err(error);
        }
        self.preload_calls.fetch_add(1, Ordering::SeqCst);

        let cleanups = self.preload_cleanups.clone();
        Ok(PendingPreload {
            cleanup: Box::new(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            }),
            complete: future::ready(self.preload_outcome.lock().clone()).boxed(),
        })
    }
}
