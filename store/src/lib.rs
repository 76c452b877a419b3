//! A key-value store persisted to one file and shared by several processes.
//!
//! Every process opens the same file and the same named lock primitives;
//! [`SynchronizedStore`] runs each operation under a writer-priority
//! reader/writer lock so that at most `reader_bound` readers, or exactly one
//! writer, touch the file at a time.

pub mod codec;
pub mod config;
pub mod coordinator;
mod errors;
pub mod persist;
pub mod segment;
pub mod store;
pub mod sync;

#[cfg(test)]
mod tests;

pub use codec::{Codec, CodecError};
pub use config::{LockConfig, StoreConfig, StoreConfigBuilder};
pub use coordinator::{unlink_primitives, Coordinator, LockCoordinator, LockGuard, LockMode};
pub use errors::{Result, StoreError};
pub use persist::PersistedStore;
pub use store::{SnapshotStore, Store};
pub use sync::{FileStore, SynchronizedStore};
