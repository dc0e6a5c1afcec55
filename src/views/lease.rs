//! Per-consumer leases over shared views.

use super::details::ResultDetails;
use super::shared::SharedView;
use crate::client::Unsubscribe;
use crate::registry::RecordId;
use crate::types::Ttl;
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback run exactly once when a lease is released.
pub(crate) type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Default buffer size for [`ViewWatch`].
pub const DEFAULT_WATCH_BUFFER: usize = 64;

/// A consumer's handle on a shared view.
///
/// Reads go straight to the shared view. Releasing (explicitly with
/// [`destroy`](ViewLease::destroy) or by dropping) gives up this lease's
/// reference; the view is torn down when the last lease goes.
pub struct ViewLease {
    shared: SharedView,
    record: Option<RecordId>,
    on_release: Mutex<Option<ReleaseFn>>,
    released: AtomicBool,
    watch_buffer: usize,
}

impl ViewLease {
    pub(crate) fn new(
        shared: SharedView,
        record: Option<RecordId>,
        on_release: Option<ReleaseFn>,
        watch_buffer: usize,
    ) -> Self {
        Self {
            shared,
            record,
            on_release: Mutex::new(on_release),
            released: AtomicBool::new(false),
            watch_buffer,
        }
    }

    /// The registry record this lease counts against. `None` for disabled
    /// leases, which never enter the registry.
    pub fn record_id(&self) -> Option<RecordId> {
        self.record
    }

    pub fn shared(&self) -> &SharedView {
        &self.shared
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release this lease. Only the first call has any effect.
    pub fn destroy(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let on_release = self.on_release.lock().take();
        if let Some(release) = on_release {
            release();
        }
    }

    pub fn data(&self) -> Value {
        self.shared.data()
    }

    pub fn details(&self) -> ResultDetails {
        self.shared.details()
    }

    pub fn current(&self) -> (Value, ResultDetails) {
        self.shared.current()
    }

    pub fn add_update_listener<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.add_update_listener(listener)
    }

    pub fn ensure_subscribed(&self) {
        self.shared.ensure_subscribed();
    }

    pub fn update_ttl(&self, ttl: Ttl) {
        self.shared.update_ttl(ttl);
    }

    /// Receive updates over a channel, for blocking consumers.
    pub fn watch(&self) -> ViewWatch {
        self.watch_with_capacity(self.watch_buffer)
    }

    /// Like [`watch`](Self::watch) with an explicit buffer size.
    pub fn watch_with_capacity(&self, capacity: usize) -> ViewWatch {
        let (sender, receiver) = bounded(capacity.max(1));
        let missed = Arc::new(AtomicU64::new(0));

        let view = self.shared.downgrade();
        let missed_count = missed.clone();
        let detach = self.shared.add_update_listener(move || {
            let Some(view) = SharedView::upgrade(&view) else {
                return;
            };
            let (data, details) = view.current();
            if sender.try_send(ViewUpdate { data, details }).is_err() {
                missed_count.fetch_add(1, Ordering::SeqCst);
            }
        });

        ViewWatch {
            receiver,
            missed,
            detach: Some(detach),
        }
    }
}

impl Drop for ViewLease {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for ViewLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewLease")
            .field("record", &self.record)
            .field("released", &self.is_released())
            .field("shared", &self.shared)
            .finish()
    }
}

/// A view's data and status at one point in time.
#[derive(Clone, Debug)]
pub struct ViewUpdate {
    pub data: Value,
    pub details: ResultDetails,
}

/// Channel of updates from one shared view.
///
/// Updates that arrive while the buffer is full are discarded and counted
/// in [`missed`](ViewWatch::missed). The listener is detached on drop.
pub struct ViewWatch {
    receiver: Receiver<ViewUpdate>,
    missed: Arc<AtomicU64>,
    detach: Option<Unsubscribe>,
}

impl ViewWatch {
    /// Receive the next update (blocking).
    pub fn recv(&self) -> Result<ViewUpdate, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an update (non-blocking).
    pub fn try_recv(&self) -> Result<ViewUpdate, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ViewUpdate, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Updates dropped because the buffer was full.
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::SeqCst)
    }
}

impl Drop for ViewWatch {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientHandle;
    use crate::memory::MemoryClient;
    use crate::types::{Emission, Query, QueryDef};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn make_lease(client: &Arc<MemoryClient>, on_release: Option<ReleaseFn>) -> ViewLease {
        let handle = ClientHandle::with_client(client.clone());
        let shared = SharedView::new(Query::new(QueryDef::new("issues")), handle, true);
        shared.ensure_subscribed();
        ViewLease::new(shared, Some(RecordId(1)), on_release, 2)
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let client = Arc::new(MemoryClient::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lease = make_lease(
            &client,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        lease.destroy();
        lease.destroy();
        drop(lease);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let client = Arc::new(MemoryClient::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lease = make_lease(
            &client,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(!lease.is_released());

        drop(lease);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reads_are_live() {
        let client = Arc::new(MemoryClient::new());
        let lease = make_lease(&client, None);
        assert_eq!(lease.data(), json!([]));

        client.emit_to("issues", Emission::complete(json!([{"id": 3}])));
        let (data, details) = lease.current();
        assert_eq!(data, json!([{"id": 3}]));
        assert!(details.is_complete());
    }

    #[test]
    fn test_watch_receives_updates() {
        let client = Arc::new(MemoryClient::new());
        let lease = make_lease(&client, None);
        let watch = lease.watch();

        client.emit_to("issues", Emission::unknown(json!([1])));
        let update = watch.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(update.data, json!([1]));
        assert!(update.details.is_unknown());
    }

    #[test]
    fn test_watch_counts_missed_updates() {
        let client = Arc::new(MemoryClient::new());
        let lease = make_lease(&client, None);
        let watch = lease.watch();

        for i in 0..5 {
            client.emit_to("issues", Emission::complete(json!([i])));
        }

        // Buffer of 2
        assert_eq!(watch.missed(), 3);
        assert_eq!(watch.try_recv().unwrap().data, json!([0]));
        assert_eq!(watch.try_recv().unwrap().data, json!([1]));
        assert!(watch.try_recv().is_err());
        assert_eq!(lease.data(), json!([4]));
    }

    #[test]
    fn test_watch_detaches_on_drop() {
        let client = Arc::new(MemoryClient::new());
        let lease = make_lease(&client, None);

        let watch = lease.watch();
        assert_eq!(lease.shared().listener_count(), 1);
        drop(watch);
        assert_eq!(lease.shared().listener_count(), 0);
    }
}
