use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::stats::EpStats;

/// An item held by a [`HashTable`].
///
/// A non-resident value has been ejected from memory and lives only in the
/// backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    key: String,
    value: Option<Bytes>,
    row_id: i64,
}

impl StoredValue {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Backing store row, or -1 if the item was never persisted.
    pub fn row_id(&self) -> i64 {
        self.row_id
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    fn data_size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Bytes::len)
    }
}

/// Callback of [`HashTable::visit`].
pub trait HashTableVisitor {
    fn visit(&mut self, value: &StoredValue);
}

#[derive(Debug, Default)]
struct Inner {
    values: BTreeMap<String, StoredValue>,
    non_resident: usize,
    data_size: usize,
}

/// The in-memory item set of one vbucket.
///
/// Item bytes are accounted in [`EpStats::current_size`] for as long as they
/// are held here.
#[derive(Debug)]
pub struct HashTable {
    inner: Mutex<Inner>,
    stats: Arc<EpStats>,
}

impl HashTable {
    pub fn new(stats: Arc<EpStats>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stats,
        }
    }

    /// Bytes of bookkeeping owned by an empty table.
    pub fn memory_size() -> usize {
        size_of::<Self>() + size_of::<Inner>()
    }

    /// Stores `value` under `key`, making the item resident.  Returns true if
    /// the key was not present before.
    pub fn set(&self, key: &str, value: Bytes, row_id: i64) -> bool {
        let new = StoredValue {
            key: key.to_string(),
            value: Some(value),
            row_id,
        };
        let mut inner = self.inner.lock().unwrap();
        self.add_size(&mut inner, new.data_size());
        match inner.values.insert(key.to_string(), new) {
            Some(old) => {
                if !old.is_resident() {
                    inner.non_resident -= 1;
                }
                self.remove_size(&mut inner, old.data_size());
                false
            }
            None => true,
        }
    }

    /// Records the backing store row of `key`.  Returns false if the key is
    /// unknown.
    pub fn set_row_id(&self, key: &str, row_id: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.values.get_mut(key) {
            Some(value) => {
                value.row_id = row_id;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredValue> {
        self.inner.lock().unwrap().values.get(key).cloned()
    }

    /// Removes `key`.  Returns false if it was not present.
    pub fn del(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.values.remove(key) {
            Some(old) => {
                if !old.is_resident() {
                    inner.non_resident -= 1;
                }
                self.remove_size(&mut inner, old.data_size());
                true
            }
            None => false,
        }
    }

    /// Drops the value of `key` from memory, keeping its key and row id.
    ///
    /// Only persisted items can be ejected.  Returns false if `key` is
    /// unknown, not persisted, or already non-resident.
    pub fn eject(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let freed = match inner.values.get_mut(key) {
            Some(value) if value.is_resident() && value.row_id >= 0 => {
                value.value.take().map_or(0, |v| v.len())
            }
            _ => return false,
        };
        inner.non_resident += 1;
        self.remove_size(&mut inner, freed);
        true
    }

    pub fn num_items(&self) -> usize {
        self.inner.lock().unwrap().values.len()
    }

    pub fn num_non_resident_items(&self) -> usize {
        self.inner.lock().unwrap().non_resident
    }

    /// Calls `visitor` for every item, in key order.  The table is locked for
    /// the duration of the walk, so the visitor sees a point-in-time view.
    pub fn visit(&self, visitor: &mut dyn HashTableVisitor) {
        let inner = self.inner.lock().unwrap();
        for value in inner.values.values() {
            visitor.visit(value);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let size = inner.data_size;
        self.remove_size(&mut inner, size);
        inner.values.clear();
        inner.non_resident = 0;
    }

    fn add_size(&self, inner: &mut Inner, size: usize) {
        inner.data_size += size;
        self.stats.current_size.incr(size);
    }

    fn remove_size(&self, inner: &mut Inner, size: usize) {
        inner.data_size -= size;
        self.stats.current_size.decr(size);
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod test {
    use super::{HashTable, HashTableVisitor, StoredValue};
    use crate::stats::EpStats;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[derive(Default)]
    struct Keys(Vec<(String, bool)>);

    impl HashTableVisitor for Keys {
        fn visit(&mut self, value: &StoredValue) {
            self.0.push((value.key().to_string(), value.is_resident()));
        }
    }

    #[test]
    fn residency_and_accounting() {
        let stats = Arc::new(EpStats::default());
        let ht = HashTable::new(stats.clone());

        assert!(ht.set("b", Bytes::from_static(b"1234"), 10));
        assert!(ht.set("a", Bytes::from_static(b"12"), -1));
        assert!(!ht.set("b", Bytes::from_static(b"123456"), 10));
        assert_eq!(stats.current_size.get(), 3 + 7);

        // Unpersisted items stay resident.
        assert!(!ht.eject("a"));
        assert!(ht.eject("b"));
        assert!(!ht.eject("b"));
        assert_eq!(ht.num_items(), 2);
        assert_eq!(ht.num_non_resident_items(), 1);
        assert_eq!(stats.current_size.get(), 3 + 1);

        let mut keys = Keys::default();
        ht.visit(&mut keys);
        assert_eq!(
            keys.0,
            vec![("a".to_string(), true), ("b".to_string(), false)]
        );

        assert!(ht.del("b"));
        assert!(!ht.del("b"));
        assert_eq!(ht.num_non_resident_items(), 0);

        drop(ht);
        assert_eq!(stats.current_size.get(), 0);
    }

    #[test]
    fn row_ids() {
        let ht = HashTable::new(Arc::new(EpStats::default()));
        ht.set("k", Bytes::from_static(b"v"), -1);
        assert!(ht.set_row_id("k", 42));
        assert!(!ht.set_row_id("missing", 1));
        assert_eq!(ht.get("k").map(|v| v.row_id()), Some(42));
    }
}
