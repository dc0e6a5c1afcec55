//! View registry: deduplicates views by query identity and counts leases.

use crate::client::ClientHandle;
use crate::error::{Result, ViewError};
use crate::types::{Query, QueryAddress, Ttl};
use crate::views::{ReleaseFn, SharedView, ViewLease, DEFAULT_WATCH_BUFFER};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Identifier of a registry record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub u64);

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// TTL requested on every newly created view.
    /// Default: None (client default)
    pub default_ttl: Option<Ttl>,

    /// Buffer size for [`ViewLease::watch`].
    /// Default: 64
    pub watch_buffer_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            watch_buffer_size: DEFAULT_WATCH_BUFFER,
        }
    }
}

/// Which map indexes a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Identity {
    Key(String),
    Query(QueryAddress),
    /// No identity: never shared, never indexed.
    Unshared,
}

impl Identity {
    fn resolve(query: &Query, key: Option<&str>) -> Self {
        match (key, query.address()) {
            (Some(key), _) if !key.is_empty() => Identity::Key(key.to_string()),
            (_, Some(address)) => Identity::Query(address),
            (_, None) => Identity::Unshared,
        }
    }
}

struct ViewRecord {
    /// Live leases; always >= 1 while the record exists.
    refs: usize,
    shared: SharedView,
    identity: Identity,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<RecordId, ViewRecord>,
    by_key: HashMap<String, RecordId>,
    by_query: HashMap<QueryAddress, RecordId>,
    next_id: u64,
    closed: bool,
}

impl RegistryState {
    fn lookup(&self, identity: &Identity) -> Option<RecordId> {
        match identity {
            Identity::Key(key) => self.by_key.get(key).copied(),
            Identity::Query(address) => self.by_query.get(address).copied(),
            Identity::Unshared => None,
        }
    }

    fn index(&mut self, identity: &Identity, id: RecordId) {
        match identity {
            Identity::Key(key) => {
                self.by_key.insert(key.clone(), id);
            }
            Identity::Query(address) => {
                self.by_query.insert(*address, id);
            }
            Identity::Unshared => {}
        }
    }

    fn unindex(&mut self, identity: &Identity, id: RecordId) {
        match identity {
            Identity::Key(key) => {
                if self.by_key.get(key) == Some(&id) {
                    self.by_key.remove(key);
                }
            }
            Identity::Query(address) => {
                if self.by_query.get(address) == Some(&id) {
                    self.by_query.remove(address);
                }
            }
            Identity::Unshared => {}
        }
    }
}

struct RegistryShared {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
}

impl RegistryShared {
    fn release(&self, id: RecordId) -> Result<()> {
        let purged = {
            let mut state = self.state.lock();
            let Some(record) = state.records.get_mut(&id) else {
                if state.closed {
                    tracing::debug!(record = %id, "release after registry shutdown");
                } else {
                    tracing::warn!(record = %id, "release of unknown view record");
                }
                return Err(ViewError::UnknownRecord(id));
            };

            record.refs -= 1;
            if record.refs > 0 {
                tracing::trace!(record = %id, refs = record.refs, "lease released");
                return Ok(());
            }

            let Some(record) = state.records.remove(&id) else {
                return Err(ViewError::UnknownRecord(id));
            };
            state.unindex(&record.identity, id);
            record
        };

        tracing::debug!(record = %id, table = purged.shared.query().table(), "purging view record");
        purged.shared.finalize();
        Ok(())
    }

    fn shutdown(&self) {
        let records: Vec<ViewRecord> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.by_key.clear();
            state.by_query.clear();
            state.records.drain().map(|(_, r)| r).collect()
        };

        if !records.is_empty() {
            tracing::debug!(views = records.len(), "shutting down view registry");
        }
        for record in records {
            record.shared.finalize();
        }
    }
}

impl Drop for RegistryShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Hands out leases on shared views, one view per query identity.
///
/// Identity is the explicit key if one is given, otherwise the query
/// object's identity; ephemeral queries without a key are never shared.
/// Each application scope constructs its own registry; clones share it.
/// Views are finalized when the last lease is released, or when the last
/// registry handle is dropped.
#[derive(Clone)]
pub struct ViewRegistry {
    shared: Arc<RegistryShared>,
}

impl ViewRegistry {
    /// Create a registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                config,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Lease a view for `query`.
    ///
    /// Disabled leases get a private view that never materializes and never
    /// enters the registry. Otherwise an existing view for the same identity
    /// is reused (and asked to subscribe if it has not yet), or a new one is
    /// created and materialized. A missing client defers materialization.
    pub fn lease(
        &self,
        client: &ClientHandle,
        query: &Query,
        enabled: bool,
        key: Option<&str>,
    ) -> ViewLease {
        let watch_buffer = self.shared.config.watch_buffer_size;

        if !enabled {
            let shared = SharedView::new(query.clone(), client.clone(), false);
            return ViewLease::new(shared, None, None, watch_buffer);
        }

        let identity = Identity::resolve(query, key);
        let (id, shared, created) = {
            let mut state = self.shared.state.lock();
            let existing = state.lookup(&identity).and_then(|id| {
                let record = state.records.get_mut(&id);
                // Index entries are removed together with their record.
                debug_assert!(record.is_some(), "index refers to purged record {}", id);
                record.map(|record| {
                    record.refs += 1;
                    (id, record.shared.clone())
                })
            });
            match existing {
                Some((id, shared)) => (id, shared, false),
                None => {
                    let (id, shared) = self.insert(&mut state, client, query, identity);
                    (id, shared, true)
                }
            }
        };

        if created {
            tracing::debug!(record = %id, table = query.table(), "created view record");
        }
        shared.ensure_subscribed();

        ViewLease::new(shared, Some(id), Some(self.release_fn(id)), watch_buffer)
    }

    fn insert(
        &self,
        state: &mut RegistryState,
        client: &ClientHandle,
        query: &Query,
        identity: Identity,
    ) -> (RecordId, SharedView) {
        state.next_id += 1;
        let id = RecordId(state.next_id);

        let shared = SharedView::new(query.clone(), client.clone(), true);
        if let Some(ttl) = self.shared.config.default_ttl {
            shared.update_ttl(ttl);
        }

        state.index(&identity, id);
        state.closed = false;
        state.records.insert(
            id,
            ViewRecord {
                refs: 1,
                shared: shared.clone(),
                identity,
            },
        );
        (id, shared)
    }

    fn release_fn(&self, id: RecordId) -> ReleaseFn {
        let registry: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                let _ = registry.release(id);
            }
        })
    }

    /// Release one reference on a record directly.
    ///
    /// Leases do this on `destroy`; calling it by hand for a record that is
    /// already gone returns `UnknownRecord`.
    pub fn release(&self, id: RecordId) -> Result<()> {
        self.shared.release(id)
    }

    /// Number of live records.
    pub fn live_views(&self) -> usize {
        self.shared.state.lock().records.len()
    }

    /// Reference count of a record.
    pub fn refs(&self, id: RecordId) -> Option<usize> {
        self.shared.state.lock().records.get(&id).map(|r| r.refs)
    }

    /// Reference count of the view registered under `key`.
    pub fn refs_for_key(&self, key: &str) -> Option<usize> {
        let state = self.shared.state.lock();
        let id = state.by_key.get(key)?;
        state.records.get(id).map(|r| r.refs)
    }

    /// Reference count of the view registered for this query object.
    pub fn refs_for_query(&self, query: &Query) -> Option<usize> {
        let state = self.shared.state.lock();
        let id = state.by_query.get(&query.address()?)?;
        state.records.get(id).map(|r| r.refs)
    }

    /// Finalize every view and forget all records.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl fmt::Debug for ViewRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ViewRegistry")
            .field("records", &state.records.len())
            .field("by_key", &state.by_key.len())
            .field("by_query", &state.by_query.len())
            .finish()
    }
}
