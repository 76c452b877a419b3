//! File-backed store.
//!
//! The file is the only channel through which processes see each other's
//! writes, so every public operation reloads the whole snapshot before it
//! acts and every mutation rewrites the whole file afterwards.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::hash::Hash;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, Span};

use crate::codec::Codec;
use crate::config::StoreConfig;
use crate::errors::{Result, StoreError};
use crate::store::{SnapshotStore, Store};

pub struct PersistedStore<K, V> {
    path: PathBuf,
    codec: Codec,
    atomic_writes: bool,
    snapshot: SnapshotStore<K, V>,
    span: Span,
}

impl<K, V> PersistedStore<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash,
    V: Serialize + DeserializeOwned,
{
    /// Opens the store file, writing an empty snapshot when the file is
    /// missing or empty.
    pub fn open(config: &StoreConfig, span: Span) -> Result<Self> {
        let mut store = PersistedStore {
            path: config.file_path.clone(),
            codec: config.codec,
            atomic_writes: config.atomic_writes,
            snapshot: SnapshotStore::new(),
            span,
        };
        if store.non_zero_file() {
            store.reload()?;
            debug!(parent: &store.span, path = %store.path.display(), entries = store.snapshot.len(), "previous store content loaded");
        } else {
            store.persist()?;
            debug!(parent: &store.span, path = %store.path.display(), "new store initialized");
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn non_zero_file(&self) -> bool {
        match fs::metadata(&self.path) {
            Ok(meta) => meta.len() > 0,
            Err(e) => {
                debug!(parent: &self.span, path = %self.path.display(), error = %e, "store file not readable");
                false
            }
        }
    }

    /// Replaces the in-memory snapshot with the file's content.
    pub fn reload(&mut self) -> Result<()> {
        let bytes = fs::read(&self.path).map_err(|e| StoreError::file_access(&self.path, e))?;
        let entries = self
            .codec
            .decode(&bytes)
            .map_err(|e| StoreError::serialization(&self.path, e))?;
        self.snapshot.replace(entries);
        Ok(())
    }

    /// Rewrites the whole file with the in-memory snapshot.
    pub fn persist(&self) -> Result<()> {
        let bytes = self
            .codec
            .encode(self.snapshot.dump())
            .map_err(|e| StoreError::serialization(&self.path, e))?;
        if self.atomic_writes {
            self.replace_file(&bytes)
        } else {
            fs::write(&self.path, &bytes).map_err(|e| StoreError::file_access(&self.path, e))
        }
    }

    fn replace_file(&self, bytes: &[u8]) -> Result<()> {
        let tmp_path = self.tmp_path();
        let written = File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::file_access(&self.path, e));
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", process::id()));
        self.path.with_file_name(name)
    }

    fn logged<T>(&self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!(op, path = %self.path.display(), error = %e, "store operation failed");
        }
        result
    }
}

impl<K, V> Store for PersistedStore<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone + fmt::Debug,
    V: Serialize + DeserializeOwned + Clone + fmt::Debug,
{
    type Key = K;
    type Value = V;

    fn set(&mut self, key: K, value: V) -> Result<bool> {
        let result = self.reload().and_then(|()| {
            let is_set = self.snapshot.set(key, value);
            self.persist()?;
            Ok(is_set)
        });
        self.logged("set", result)
    }

    fn get(&mut self, key: &K) -> Result<Option<V>> {
        let result = self.reload().map(|()| self.snapshot.get(key).cloned());
        self.logged("get", result)
    }

    fn delete(&mut self, key: &K) -> Result<Option<V>> {
        let result = self.reload().and_then(|()| {
            let removed = self.snapshot.delete(key);
            self.persist()?;
            Ok(removed)
        });
        self.logged("delete", result)
    }

    fn dump(&mut self) -> Result<HashMap<K, V>> {
        let result = self.reload().map(|()| self.snapshot.dump().clone());
        self.logged("dump", result)
    }

    fn describe(&mut self) -> Result<String> {
        let result = self
            .reload()
            .map(|()| format!("{}: {}", self.path.display(), self.snapshot));
        self.logged("describe", result)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use tempfile::tempdir;

    use super::*;

    fn config(path: &Path, codec: Codec, atomic_writes: bool) -> StoreConfig {
        StoreConfig::builder()
            .file_path(path)
            .codec(codec)
            .atomic_writes(atomic_writes)
            .build()
            .expect("valid config")
    }

    #[test]
    fn missing_file_is_created_empty() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("testfile.bin");
        let mut db: PersistedStore<String, String> =
            PersistedStore::open(&config(&path, Codec::Bincode, true), Span::none())?;
        assert!(fs::metadata(&path)?.len() > 0);
        assert!(db.dump()?.is_empty());
        Ok(())
    }

    #[test]
    fn operations_reach_the_file() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("testfile.bin");
        let cfg = config(&path, Codec::Bincode, true);
        let mut db: PersistedStore<i32, String> = PersistedStore::open(&cfg, Span::none())?;
        assert!(db.set(1, "3".to_string())?);
        assert!(db.set(2, "2".to_string())?);
        assert_eq!(db.get(&1)?, Some("3".to_string()));
        assert_eq!(db.delete(&2)?, Some("2".to_string()));
        assert_eq!(db.get(&2)?, None);
        assert_eq!(db.delete(&2)?, None);
        assert_eq!(db.describe()?, format!("{}: {{1: \"3\"}}", path.display()));

        let on_disk: HashMap<i32, String> = Codec::Bincode.decode(&fs::read(&path)?)?;
        assert_eq!(on_disk, HashMap::from([(1, "3".to_string())]));
        Ok(())
    }

    #[test]
    fn fresh_instance_sees_previous_writes() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("roundtrip.json");
        let cfg = config(&path, Codec::Json, false);
        {
            let mut db: PersistedStore<i64, i64> = PersistedStore::open(&cfg, Span::none())?;
            for k in 0..100 {
                db.set(k, k * k)?;
            }
        }
        let mut reopened: PersistedStore<i64, i64> = PersistedStore::open(&cfg, Span::none())?;
        let expected: HashMap<i64, i64> = (0..100).map(|k| (k, k * k)).collect();
        assert_eq!(reopened.dump()?, expected);
        Ok(())
    }

    #[test]
    fn reload_picks_up_other_writers() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("shared.bin");
        let cfg = config(&path, Codec::Bincode, true);
        let mut first: PersistedStore<String, i64> = PersistedStore::open(&cfg, Span::none())?;
        let mut second: PersistedStore<String, i64> = PersistedStore::open(&cfg, Span::none())?;
        first.set("a".to_string(), 1)?;
        second.set("b".to_string(), 2)?;
        assert_eq!(first.get(&"b".to_string())?, Some(2));
        assert_eq!(second.get(&"a".to_string())?, Some(1));
        Ok(())
    }

    #[test]
    fn empty_file_is_reinitialized() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.bin");
        File::create(&path)?;
        let mut db: PersistedStore<String, i64> =
            PersistedStore::open(&config(&path, Codec::Bincode, true), Span::none())?;
        assert!(db.dump()?.is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_a_serialization_error() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("corrupt.json");
        fs::write(&path, b"{ definitely not a snapshot")?;
        let opened: Result<PersistedStore<String, i64>> =
            PersistedStore::open(&config(&path, Codec::Json, true), Span::none());
        assert!(matches!(opened, Err(StoreError::Serialization { .. })));
        Ok(())
    }

    #[test]
    fn removed_file_is_a_file_access_error() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("gone.bin");
        let mut db: PersistedStore<String, i64> =
            PersistedStore::open(&config(&path, Codec::Bincode, true), Span::none())?;
        fs::remove_file(&path)?;
        assert!(matches!(
            db.get(&"k".to_string()),
            Err(StoreError::FileAccess { .. })
        ));
        Ok(())
    }

    #[test]
    fn atomic_writes_leave_no_temporary_files() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("atomic.bin");
        let mut db: PersistedStore<String, i64> =
            PersistedStore::open(&config(&path, Codec::Bincode, true), Span::none())?;
        db.set("x".to_string(), 1)?;
        let names: Vec<_> = fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(names, vec![std::ffi::OsString::from("atomic.bin")]);
        Ok(())
    }
}
