//! Shared views and the leases consumers hold on them.
//!
//! A [`SharedView`] owns one client subscription and the latest snapshot and
//! status it produced. Consumers never hold the view directly; they hold a
//! [`ViewLease`] handed out by the registry, and the view is torn down when
//! the last lease is released.
//!
//! # Example
//!
//! ```ignore
//! let lease = registry.lease(&client, &query, true, Some("open-issues"));
//!
//! let remove = lease.add_update_listener(|| println!("changed"));
//! let (data, details) = lease.current();
//!
//! remove();
//! lease.destroy();
//! ```

mod details;
mod lease;
mod shared;

pub(crate) use lease::ReleaseFn;

pub use details::{
    QueryErrorDetails, ResultDetails, RetryHandle, DEFAULT_ERROR_MESSAGE, DEFAULT_ERROR_TYPE,
};
pub use lease::{ViewLease, ViewUpdate, ViewWatch, DEFAULT_WATCH_BUFFER};
pub use shared::{SharedView, UpdateListener};
