use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::errors::Result;

/// Key-value capability shared by every layer of the store.
///
/// Methods take `&mut self` even for reads because layers above the
/// in-memory map refresh their state before answering.
pub trait Store {
    type Key;
    type Value;

    fn set(&mut self, key: Self::Key, value: Self::Value) -> Result<bool>;

    fn get(&mut self, key: &Self::Key) -> Result<Option<Self::Value>>;

    fn delete(&mut self, key: &Self::Key) -> Result<Option<Self::Value>>;

    fn dump(&mut self) -> Result<HashMap<Self::Key, Self::Value>>;

    fn describe(&mut self) -> Result<String>;
}

/// Plain in-memory map. No I/O and no locking.
#[derive(Clone, Debug)]
pub struct SnapshotStore<K, V> {
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash, V: PartialEq> PartialEq for SnapshotStore<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K, V> Default for SnapshotStore<K, V> {
    fn default() -> Self {
        SnapshotStore {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> SnapshotStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: HashMap<K, V>) -> Self {
        SnapshotStore { entries }
    }

    pub fn set(&mut self, key: K, value: V) -> bool {
        self.entries.insert(key, value);
        true
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn delete(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn dump(&self) -> &HashMap<K, V> {
        &self.entries
    }

    /// Installs a freshly loaded snapshot, dropping whatever was held before.
    pub fn replace(&mut self, entries: HashMap<K, V>) {
        self.entries = entries;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_inner(self) -> HashMap<K, V> {
        self.entries
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Display for SnapshotStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.entries)
    }
}

impl<K, V> Store for SnapshotStore<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone + fmt::Debug,
{
    type Key = K;
    type Value = V;

    fn set(&mut self, key: K, value: V) -> Result<bool> {
        Ok(SnapshotStore::set(self, key, value))
    }

    fn get(&mut self, key: &K) -> Result<Option<V>> {
        Ok(self.entries.get(key).cloned())
    }

    fn delete(&mut self, key: &K) -> Result<Option<V>> {
        Ok(self.entries.remove(key))
    }

    fn dump(&mut self) -> Result<HashMap<K, V>> {
        Ok(self.entries.clone())
    }

    fn describe(&mut self) -> Result<String> {
        Ok(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let mut db = SnapshotStore::new();
        assert!(db.set("1".to_string(), "a"));
        assert_eq!(db.get(&"1".to_string()), Some(&"a"));
        assert_eq!(db.get(&"2".to_string()), None);
        assert_eq!(db.delete(&"2".to_string()), None);
        assert_eq!(db.delete(&"1".to_string()), Some("a"));
        assert!(db.is_empty());
        assert_eq!(db.to_string(), "{}");
    }

    #[test]
    fn set_overwrites_existing_key() {
        let mut db = SnapshotStore::new();
        db.set(7, 1);
        db.set(7, 2);
        assert_eq!(db.len(), 1);
        assert_eq!(db.get(&7), Some(&2));
    }

    #[test]
    fn replace_discards_previous_entries() {
        let mut db = SnapshotStore::from_entries(HashMap::from([(1, 10), (2, 20)]));
        db.replace(HashMap::from([(3, 30)]));
        assert_eq!(db.dump(), &HashMap::from([(3, 30)]));
        assert_eq!(db, SnapshotStore::from_entries(HashMap::from([(3, 30)])));
    }

    #[test]
    fn store_trait_clones_values_out() -> Result<()> {
        let mut db: SnapshotStore<i32, String> = SnapshotStore::new();
        Store::set(&mut db, 1, "one".to_string())?;
        assert_eq!(Store::get(&mut db, &1)?, Some("one".to_string()));
        assert_eq!(Store::dump(&mut db)?.len(), 1);
        assert_eq!(Store::describe(&mut db)?, r#"{1: "one"}"#);
        Ok(())
    }
}
