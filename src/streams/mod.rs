//! Stream and task interface over the sync client.
//!
//! For consumers that prefer async streams to listeners:
//! - [`ViewStreams::query`]: lazy stream of snapshots for one query
//! - [`ViewStreams::connection_state`]: stream of connection states
//! - [`ViewStreams::run_query`] / [`ViewStreams::run_with_options`]: one-shot fetch
//! - [`ViewStreams::preload`]: warm a query without observing it
//!
//! Each stream owns its own subscription or listener and releases it on
//! every exit path: end of stream, error, `cancel`, or drop. Failures end
//! only the stream they occur in.
//!
//! # Example
//!
//! ```ignore
//! let streams = ViewStreams::new(client.clone());
//! let mut snapshots = streams.query(move || Some(query.clone()));
//!
//! while let Some(item) = snapshots.next().await {
//!     match item {
//!         Ok(snapshot) => println!("{:?}: {}", snapshot.kind, snapshot.data),
//!         Err(e) => eprintln!("query failed: {}", e),
//!     }
//! }
//! ```

mod connection;
mod query;
mod session;

pub use connection::ConnectionStateStream;
pub use query::{QueryFn, QueryStream, Snapshot};

use crate::client::{ClientHandle, Unsubscribe};
use crate::error::{Result, ViewError};
use crate::types::{PreloadOptions, Query, RunOptions};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::fmt;

/// Entry point for streams and one-shot operations.
#[derive(Clone, Debug)]
pub struct ViewStreams {
    client: ClientHandle,
}

impl ViewStreams {
    pub fn new(client: ClientHandle) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    /// Stream snapshots of the query returned by `query_fn`.
    ///
    /// `query_fn` runs on first poll; if it returns `None` the stream ends
    /// without subscribing. An error emission is yielded as the last item.
    pub fn query<F>(&self, query_fn: F) -> QueryStream
    where
        F: FnOnce() -> Option<Query> + Send + 'static,
    {
        QueryStream::new(self.client.clone(), Box::new(query_fn))
    }

    /// Stream the connection state, starting with the current one.
    pub fn connection_state(&self) -> ConnectionStateStream {
        ConnectionStateStream::acquire(&self.client)
    }

    /// Fetch a query once with default options.
    pub async fn run_query<F>(&self, query_fn: F) -> Result<Value>
    where
        F: FnOnce() -> Query,
    {
        self.run_with_options(query_fn, RunOptions::default()).await
    }

    /// Fetch a query once.
    pub async fn run_with_options<F>(&self, query_fn: F, options: RunOptions) -> Result<Value>
    where
        F: FnOnce() -> Query,
    {
        let client = self.client.require()?;
        let query = query_fn();
        tracing::debug!(table = query.table(), kind = ?options.kind, "running query");
        let pending = client.run(&query, options);
        pending.await.map_err(ViewError::from)
    }

    /// Start preloading a query.
    pub fn preload<F>(&self, query_fn: F, options: PreloadOptions) -> Result<PreloadHandle>
    where
        F: FnOnce() -> Query,
    {
        let client = self.client.require()?;
        let query = query_fn();
        tracing::debug!(table = query.table(), "preloading query");
        let pending = client.preload(&query, options)?;
        Ok(PreloadHandle {
            cleanup: Some(pending.cleanup),
            complete: Some(pending.complete),
        })
    }
}

/// Handle to an outstanding preload.
///
/// The preloaded data stays warm until [`cleanup`](Self::cleanup) is called;
/// dropping the handle does not release it.
pub struct PreloadHandle {
    cleanup: Option<Unsubscribe>,
    complete: Option<BoxFuture<'static, std::result::Result<(), crate::error::ClientError>>>,
}

impl PreloadHandle {
    /// Release the preload. Only the first call has any effect.
    pub fn cleanup(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }

    /// Wait for the preload to finish syncing. Resolves immediately if it
    /// was already awaited.
    pub async fn completed(&mut self) -> Result<()> {
        match self.complete.take() {
            Some(complete) => complete.await.map_err(ViewError::from),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PreloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadHandle")
            .field("cleaned_up", &self.cleanup.is_none())
            .field("completed", &self.complete.is_none())
            .finish()
    }
}
