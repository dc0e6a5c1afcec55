//! Sync client contract and the handle that holds a client.
//!
//! The broker never talks to the network itself. Everything it needs from
//! the sync client is expressed by [`SyncClient`]; optional capabilities
//! (TTL control, connection monitoring) are `Option`s that are probed once.

use crate::error::{ClientError, Result, ViewError};
use crate::types::{ConnectionState, Emission, PreloadOptions, Query, RunOptions, Ttl};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback that detaches a listener when invoked.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Listener for client view emissions.
pub type EmissionListener = Arc<dyn Fn(&Emission) + Send + Sync>;

/// Listener for connection state changes.
pub type ConnectionListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// A live materialized query inside the sync client.
pub trait ClientView: Send + Sync {
    /// Register a listener. The client may call it synchronously with the
    /// current result before returning.
    fn add_listener(&self, listener: EmissionListener) -> Unsubscribe;

    /// Tear down the materialization.
    fn destroy(&self);
}

/// TTL control for a client view.
pub trait TtlControl: Send + Sync {
    fn update_ttl(&self, ttl: Ttl) -> std::result::Result<(), ClientError>;
}

/// Result of materializing a query.
pub struct Materialized {
    pub view: Box<dyn ClientView>,
    /// Present when the client supports TTL updates on this view.
    pub ttl: Option<Arc<dyn TtlControl>>,
}

/// Connection state observation.
pub trait ConnectionMonitor: Send + Sync {
    fn current(&self) -> ConnectionState;
    fn subscribe(&self, listener: ConnectionListener) -> Unsubscribe;
}

/// Outstanding preload request.
pub struct PendingPreload {
    /// Releases the preloaded data.
    pub cleanup: Unsubscribe,
    /// Resolves when the preload has finished syncing.
    pub complete: BoxFuture<'static, std::result::Result<(), ClientError>>,
}

/// The sync client collaborator.
pub trait SyncClient: Send + Sync {
    /// Materialize a query into a live view.
    fn materialize(&self, query: &Query) -> Materialized;

    /// Connection monitoring, if the client supports it.
    fn connection(&self) -> Option<&dyn ConnectionMonitor> {
        None
    }

    /// Run a query once.
    fn run(
        &self,
        query: &Query,
        options: RunOptions,
    ) -> BoxFuture<'static, std::result::Result<Value, ClientError>>;

    /// Start preloading a query.
    fn preload(
        &self,
        query: &Query,
        options: PreloadOptions,
    ) -> std::result::Result<PendingPreload, ClientError>;
}

type Observer = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct HandleInner {
    client: RwLock<Option<Arc<dyn SyncClient>>>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer: AtomicU64,
}

/// Slot holding the sync client, which may not be connected yet.
///
/// Clones share the same slot. Observers registered with [`on_change`]
/// run whenever a client is provided or taken away.
///
/// [`on_change`]: ClientHandle::on_change
#[derive(Clone, Default)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

impl ClientHandle {
    /// Create an empty handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle that already holds a client.
    pub fn with_client(client: Arc<dyn SyncClient>) -> Self {
        let handle = Self::new();
        *handle.inner.client.write() = Some(client);
        handle
    }

    /// Install a client, replacing any previous one.
    pub fn provide(&self, client: Arc<dyn SyncClient>) {
        *self.inner.client.write() = Some(client);
        tracing::debug!("sync client provided");
        self.notify();
    }

    /// Remove the client.
    pub fn take(&self) -> Option<Arc<dyn SyncClient>> {
        let previous = self.inner.client.write().take();
        if previous.is_some() {
            tracing::debug!("sync client removed");
            self.notify();
        }
        previous
    }

    /// The current client, if any.
    pub fn current(&self) -> Option<Arc<dyn SyncClient>> {
        self.inner.client.read().clone()
    }

    /// The current client, or `ClientUnavailable`.
    pub fn require(&self) -> Result<Arc<dyn SyncClient>> {
        self.current().ok_or(ViewError::ClientUnavailable)
    }

    pub fn is_available(&self) -> bool {
        self.inner.client.read().is_some()
    }

    /// Observe client changes. The returned callback detaches the observer.
    pub fn on_change<F>(&self, observer: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::SeqCst);
        self.inner.observers.lock().push((id, Arc::new(observer)));

        let weak: Weak<HandleInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.lock().retain(|(oid, _)| *oid != id);
            }
        })
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    fn notify(&self) {
        let observers: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer();
        }
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("available", &self.is_available())
            .field("observers", &self.observer_count())
            .finish()
    }
}
