use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug_span, error, info, Span};

use crate::config::StoreConfig;
use crate::coordinator::{Coordinator, LockCoordinator, LockGuard};
use crate::errors::Result;
use crate::persist::PersistedStore;
use crate::store::Store;

/// A store whose every operation runs under the reader/writer protocol.
///
/// Reads take the read lock; mutations, and read-then-write operations such
/// as [`SynchronizedStore::adjust`], take the write lock for their whole
/// duration.
pub struct SynchronizedStore<S, C = Coordinator> {
    store: S,
    coordinator: C,
    span: Span,
}

/// The file-backed store shared across processes by lock name.
pub type FileStore<K, V> = SynchronizedStore<PersistedStore<K, V>, Coordinator>;

impl<K, V> SynchronizedStore<PersistedStore<K, V>, Coordinator>
where
    K: Serialize + DeserializeOwned + Eq + Hash,
    V: Serialize + DeserializeOwned,
{
    /// Attaches to the named primitives and opens the store file. Creating
    /// the file is a write, so it happens under the write lock.
    pub fn open(config: &StoreConfig, span: Span) -> Result<Self> {
        config.validate()?;
        let coordinator = Coordinator::open(&config.lock, span.clone())?;
        let store = {
            let guard = coordinator.write()?;
            let opened = PersistedStore::open(config, span.clone());
            finish(guard, opened)?
        };
        info!(
            parent: &span,
            path = %config.file_path.display(),
            lock = %config.lock.name,
            "store opened"
        );
        Ok(SynchronizedStore {
            store,
            coordinator,
            span,
        })
    }
}

impl<S, C> SynchronizedStore<S, C>
where
    S: Store,
    S::Key: fmt::Debug,
    C: LockCoordinator,
{
    pub fn new(store: S, coordinator: C, span: Span) -> Self {
        SynchronizedStore {
            store,
            coordinator,
            span,
        }
    }

    pub fn set(&mut self, key: S::Key, value: S::Value) -> Result<bool> {
        let span = debug_span!(parent: &self.span, "set", key = ?key);
        let _entered = span.enter();
        let guard = self.coordinator.write()?;
        let result = self.store.set(key, value);
        finish(guard, result)
    }

    pub fn get(&mut self, key: &S::Key) -> Result<Option<S::Value>> {
        let span = debug_span!(parent: &self.span, "get", key = ?key);
        let _entered = span.enter();
        let guard = self.coordinator.read()?;
        let result = self.store.get(key);
        finish(guard, result)
    }

    pub fn delete(&mut self, key: &S::Key) -> Result<Option<S::Value>> {
        let span = debug_span!(parent: &self.span, "delete", key = ?key);
        let _entered = span.enter();
        let guard = self.coordinator.write()?;
        let result = self.store.delete(key);
        finish(guard, result)
    }

    /// Replaces the value of `key` with `f(current)` and returns the new
    /// value. The read and the write share one write lock, so concurrent
    /// adjustments never lose updates.
    pub fn adjust<F>(&mut self, key: S::Key, f: F) -> Result<S::Value>
    where
        F: FnOnce(Option<S::Value>) -> S::Value,
        S::Value: Clone,
    {
        let span = debug_span!(parent: &self.span, "adjust", key = ?key);
        let _entered = span.enter();
        let guard = self.coordinator.write()?;
        let result = adjust_locked(&mut self.store, key, f);
        finish(guard, result)
    }

    /// File identity and current content, read under the read lock.
    pub fn describe(&mut self) -> Result<String> {
        let span = debug_span!(parent: &self.span, "describe");
        let _entered = span.enter();
        let guard = self.coordinator.read()?;
        let result = self.store.describe();
        finish(guard, result)
    }

    pub fn snapshot(&mut self) -> Result<HashMap<S::Key, S::Value>> {
        let span = debug_span!(parent: &self.span, "snapshot");
        let _entered = span.enter();
        let guard = self.coordinator.read()?;
        let result = self.store.dump();
        finish(guard, result)
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    pub fn into_parts(self) -> (S, C) {
        (self.store, self.coordinator)
    }
}

fn adjust_locked<S, F>(store: &mut S, key: S::Key, f: F) -> Result<S::Value>
where
    S: Store,
    S::Value: Clone,
    F: FnOnce(Option<S::Value>) -> S::Value,
{
    let current = store.get(&key)?;
    let next = f(current);
    store.set(key, next.clone())?;
    Ok(next)
}

/// Releases `guard` whatever `result` is. An operation error wins over a
/// release error; the latter is still logged.
fn finish<C: LockCoordinator, T>(guard: LockGuard<'_, C>, result: Result<T>) -> Result<T> {
    let mode = guard.mode();
    let released = guard.release();
    if let Err(e) = &released {
        error!(?mode, error = %e, "lock release failed");
    }
    let value = result?;
    released?;
    Ok(value)
}
