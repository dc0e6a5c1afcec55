//! # View Broker
//!
//! Reference-counted, deduplicated live query views over a sync client.
//!
//! ## Core Concepts
//!
//! - **Shared views**: One client subscription per query, holding the latest snapshot and status
//! - **Leases**: Per-consumer handles; the view is torn down when the last lease goes
//! - **Registry**: Deduplicates views by key or query identity and counts leases
//! - **Streams**: Async streams and one-shot operations for non-listener consumers
//!
//! ## Example
//!
//! ```ignore
//! use view_broker::{ClientHandle, Query, QueryDef, ViewRegistry, RegistryConfig};
//!
//! let client = ClientHandle::with_client(sync_client);
//! let registry = ViewRegistry::new(RegistryConfig::default());
//!
//! let query = Query::new(QueryDef::new("issues").with_args(json!({"open": true})));
//!
//! // Both consumers share one subscription
//! let a = registry.lease(&client, &query, true, None);
//! let b = registry.lease(&client, &query, true, None);
//!
//! let remove = a.add_update_listener(|| println!("issues changed"));
//! println!("{}", b.data());
//!
//! remove();
//! a.destroy();
//! b.destroy(); // last lease: subscription torn down
//! ```

pub mod client;
pub mod error;
pub mod live;
pub mod memory;
pub mod registry;
pub mod streams;
pub mod types;
pub mod views;

// Re-exports
pub use client::{
    ClientHandle, ClientView, ConnectionListener, ConnectionMonitor, EmissionListener,
    Materialized, PendingPreload, SyncClient, TtlControl, Unsubscribe,
};
pub use error::{ClientError, Result, ViewError};
pub use live::{LiveQuery, LiveQueryOptions};
pub use memory::{MemoryClient, MemoryView};
pub use registry::{RecordId, RegistryConfig, ViewRegistry};
pub use streams::{ConnectionStateStream, PreloadHandle, QueryStream, Snapshot, ViewStreams};
pub use types::*;
pub use views::{
    QueryErrorDetails, ResultDetails, RetryHandle, SharedView, ViewLease, ViewUpdate, ViewWatch,
};
