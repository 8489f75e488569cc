//! A [`KvStore`] that keeps its data in memory.
//!
//! Items are kept in key order within each vbucket, and vbucket state
//! records are kept as the JSON documents a disk store would write, so the
//! parsing path of [`KvStore::list_persisted_vbuckets`] is the real one.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};
use vbstore_types::config::StoreConfig;
use vbstore_types::state::VBucketStateDocument;
use vbstore_types::{PersistedVBucketState, QueuedItem, VBucketId, VBucketState};

use crate::batcher::WriteBatcher;
use crate::error::StorageError;
use crate::histogram::LatencyHistogram;
use crate::{DumpCallback, KvStore, KvStoreStats, StorageProperties};

const DEFAULT_PROPERTIES: StorageProperties = StorageProperties {
    max_concurrency: 10,
    max_readers: 9,
    max_writers: 1,
    efficient_vb_dump: true,
    efficient_vb_deletion: true,
};

#[derive(Debug, Clone)]
struct StoredItem {
    value: Bytes,
    row_id: i64,
}

#[derive(Debug)]
enum PendingWrite {
    Set(QueuedItem),
    Del(VBucketId, String),
}

#[derive(Debug)]
struct Inner {
    open: bool,
    transaction: Option<Vec<PendingWrite>>,
    items: BTreeMap<(VBucketId, String), StoredItem>,
    states: BTreeMap<VBucketId, String>,
    next_row_id: i64,
    commits: u64,
    batcher: WriteBatcher,
}

impl Inner {
    fn check_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }

    fn pending(&mut self, operation: &str) -> &mut Vec<PendingWrite> {
        match self.transaction.as_mut() {
            Some(pending) => pending,
            None => panic!("{operation} invoked outside of a transaction"),
        }
    }

    fn vbucket_items(&self, vbucket: VBucketId) -> Vec<QueuedItem> {
        self.items
            .range((vbucket, String::new())..)
            .take_while(|((vb, _), _)| *vb == vbucket)
            .map(|((vb, key), stored)| {
                QueuedItem::with_value(key.clone(), stored.value.clone(), *vb, stored.row_id)
            })
            .collect()
    }

    fn write_state(
        &mut self,
        vbucket: VBucketId,
        state: PersistedVBucketState,
    ) -> Result<(), StorageError> {
        let document = serde_json::to_string(&VBucketStateDocument::from(state)).map_err(|e| {
            StorageError::StateEncoding {
                vbucket,
                error: e.to_string(),
            }
        })?;
        self.states.insert(vbucket, document);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
    properties: StorageProperties,
    snapshot_latency: LatencyHistogram,
}

impl MemoryKvStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                open: true,
                transaction: None,
                items: BTreeMap::new(),
                states: BTreeMap::new(),
                next_row_id: 1,
                commits: 0,
                batcher: WriteBatcher::new(config),
            }),
            properties: DEFAULT_PROPERTIES,
            snapshot_latency: LatencyHistogram::new(),
        }
    }

    pub fn with_properties(mut self, properties: StorageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Closes the store.  An open transaction is discarded.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        inner.transaction = None;
    }

    pub fn reopen(&self) {
        self.inner.lock().unwrap().open = true;
    }

    /// Stores a raw state document for `vbucket`, bypassing validation.
    pub fn put_state_document(&self, vbucket: VBucketId, document: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(vbucket, document.into());
    }

    /// Number of committed items across all vbuckets.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latency of [`KvStore::snapshot_vbuckets`], in microseconds.
    pub fn snapshot_latency(&self) -> &LatencyHistogram {
        &self.snapshot_latency
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_open()?;
        if inner.transaction.is_some() {
            return Err(StorageError::TransactionInProgress);
        }
        inner.transaction = Some(Vec::new());
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.check_open()?;
        let pending = std::mem::take(inner.pending("commit"));
        inner.transaction = None;
        let count = pending.len();
        for write in pending {
            match write {
                PendingWrite::Set(item) => {
                    let key = (item.vbucket(), item.key().to_string());
                    let row_id = match inner.items.get(&key) {
                        Some(existing) => existing.row_id,
                        None => {
                            let row_id = inner.next_row_id;
                            inner.next_row_id += 1;
                            row_id
                        }
                    };
                    let value = item.value().cloned().unwrap_or_default();
                    inner.items.insert(key, StoredItem { value, row_id });
                }
                PendingWrite::Del(vbucket, key) => {
                    inner.items.remove(&(vbucket, key));
                }
            }
        }
        inner.commits += 1;
        debug!("committed {count} mutations");
        Ok(())
    }

    fn rollback(&self) {
        self.inner.lock().unwrap().transaction = None;
    }

    fn set(&self, item: &QueuedItem) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_open()?;
        inner.pending("set").push(PendingWrite::Set(item.clone()));
        Ok(())
    }

    fn del(&self, key: &str, vbucket: VBucketId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_open()?;
        inner
            .pending("del")
            .push(PendingWrite::Del(vbucket, key.to_string()));
        Ok(())
    }

    fn get(&self, key: &str, vbucket: VBucketId) -> Result<Option<QueuedItem>, StorageError> {
        let inner = self.inner.lock().unwrap();
        inner.check_open()?;
        Ok(inner
            .items
            .get(&(vbucket, key.to_string()))
            .map(|stored| {
                QueuedItem::with_value(key, stored.value.clone(), vbucket, stored.row_id)
            }))
    }

    fn del_vbucket(&self, vbucket: VBucketId) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_open()?;
        let before = inner.items.len();
        inner.items.retain(|(vb, _), _| *vb != vbucket);
        let had_items = inner.items.len() != before;
        let had_state = inner.states.remove(&vbucket).is_some();
        Ok(had_items || had_state)
    }

    fn list_persisted_vbuckets(
        &self,
    ) -> Result<BTreeMap<VBucketId, PersistedVBucketState>, StorageError> {
        let inner = self.inner.lock().unwrap();
        inner.check_open()?;
        let mut result = BTreeMap::new();
        for (vbucket, document) in inner.states.iter() {
            let state = serde_json::from_str::<VBucketStateDocument>(document)
                .ok()
                .and_then(|doc| doc.to_state());
            match state {
                Some(state) => {
                    result.insert(*vbucket, state);
                }
                None => warn!(
                    "state document for vbucket {vbucket} is in the wrong format: {document}"
                ),
            }
        }
        Ok(result)
    }

    fn vb_state_changed(
        &self,
        vbucket: VBucketId,
        state: VBucketState,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_open()?;
        let checkpoint_id = inner
            .states
            .get(&vbucket)
            .and_then(|document| serde_json::from_str::<VBucketStateDocument>(document).ok())
            .and_then(|doc| doc.checkpoint_id.parse().ok())
            .unwrap_or(1);
        inner.write_state(
            vbucket,
            PersistedVBucketState {
                state,
                checkpoint_id,
            },
        )
    }

    fn snapshot_vbuckets(
        &self,
        states: &BTreeMap<VBucketId, PersistedVBucketState>,
    ) -> Result<(), StorageError> {
        if states.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.check_open()?;
        for (vbucket, state) in states {
            inner.write_state(*vbucket, *state)?;
        }
        self.snapshot_latency.record_elapsed(start);
        Ok(())
    }

    fn dump(
        &self,
        vbucket: VBucketId,
        callback: &mut DumpCallback<'_>,
    ) -> Result<(), StorageError> {
        // Release the lock before calling back, so that the callback may use
        // the store.
        let items = {
            let inner = self.inner.lock().unwrap();
            inner.check_open()?;
            inner.vbucket_items(vbucket)
        };
        debug!("dumping {} items of vbucket {vbucket}", items.len());
        items.into_iter().for_each(callback);
        Ok(())
    }

    fn dump_all(&self, callback: &mut DumpCallback<'_>) -> Result<(), StorageError> {
        let items: Vec<QueuedItem> = {
            let inner = self.inner.lock().unwrap();
            inner.check_open()?;
            inner
                .items
                .iter()
                .map(|((vb, key), stored)| {
                    QueuedItem::with_value(key.clone(), stored.value.clone(), *vb, stored.row_id)
                })
                .collect()
        };
        items.into_iter().for_each(callback);
        Ok(())
    }

    fn storage_properties(&self) -> StorageProperties {
        self.properties
    }

    fn optimize_writes(&self, items: &mut Vec<QueuedItem>) {
        let batcher = self.inner.lock().unwrap().batcher.clone();
        batcher.optimize_writes(items);
    }

    fn process_txn_size_change(&self, txn_size: usize) {
        self.inner
            .lock()
            .unwrap()
            .batcher
            .process_txn_size_change(txn_size);
    }

    fn set_vb_batch_count(&self, batch_count: usize) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .batcher
            .set_batch_count(batch_count)
            .map(|_| ())
    }

    fn stats(&self) -> KvStoreStats {
        let inner = self.inner.lock().unwrap();
        KvStoreStats {
            vbucket_batch_count: inner.batcher.batch_count(),
            vbucket_batch_size: inner.batcher.batch_size(),
            items: inner.items.len(),
            commits: inner.commits,
            snapshot_count: self.snapshot_latency.count(),
            snapshot_latency_sum_us: self.snapshot_latency.sum(),
        }
    }
}
