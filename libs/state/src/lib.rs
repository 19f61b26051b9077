//! State store for one emulated machine: a namespaced, versioned, watchable
//! resource registry with optimistic concurrency and an append-only journal
//! for durability across restarts.
//!
//! All coordination between controllers, gRPC handlers and the event
//! publisher goes through this store; there are no other shared structures.

pub mod error;
pub mod event;
mod journal;
pub mod store;

pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use store::{
    HISTORY_CAPACITY, HISTORY_GAP_TOLERANCE, Store, WatchOptions, WatchReceiver, WriteOptions,
};
