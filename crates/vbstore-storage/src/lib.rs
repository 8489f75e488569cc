//! Backing store interface for vbstore, with an in-memory implementation and
//! the write-batching optimizer used by the flusher.

use std::collections::BTreeMap;

use vbstore_types::{PersistedVBucketState, QueuedItem, VBucketId, VBucketState};

use crate::error::StorageError;

pub mod batcher;
pub mod error;
pub mod histogram;
pub mod memory;

#[cfg(test)]
mod test;

pub use batcher::WriteBatcher;
pub use memory::MemoryKvStore;

/// Per-item callback of [`KvStore::dump`].
pub type DumpCallback<'a> = dyn FnMut(QueuedItem) + 'a;

/// Capabilities of a backing store.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StorageProperties {
    /// Maximum number of concurrent readers and writers.
    pub max_concurrency: usize,

    /// Maximum number of concurrent readers.
    pub max_readers: usize,

    /// Maximum number of concurrent writers.
    pub max_writers: usize,

    /// Whether [`KvStore::dump`] can stream a single vbucket without scanning
    /// the whole store.  Enables disk backfill of low-residency vbuckets.
    pub efficient_vb_dump: bool,

    /// Whether the store can dump keys without values.
    pub efficient_vb_deletion: bool,
}

/// Snapshot of backing store statistics.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct KvStoreStats {
    pub vbucket_batch_count: usize,
    pub vbucket_batch_size: usize,
    pub items: usize,
    pub commits: u64,
    pub snapshot_count: u64,
    pub snapshot_latency_sum_us: u64,
}

/// A persistent store of items, partitioned by vbucket.
///
/// Mutations must be issued between [`begin`](Self::begin) and
/// [`commit`](Self::commit).  Issuing them outside of a transaction is a
/// programming error and panics.
pub trait KvStore: Send + Sync {
    /// Starts a transaction.  Fails with
    /// [`StorageError::TransactionInProgress`] if one is already open.
    fn begin(&self) -> Result<(), StorageError>;

    /// Commits the open transaction.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    fn commit(&self) -> Result<(), StorageError>;

    /// Discards the open transaction, if any.
    fn rollback(&self);

    /// Stores `item` as part of the open transaction.
    fn set(&self, item: &QueuedItem) -> Result<(), StorageError>;

    /// Deletes `key` from `vbucket` as part of the open transaction.
    fn del(&self, key: &str, vbucket: VBucketId) -> Result<(), StorageError>;

    /// Reads the committed value of `key`.
    fn get(&self, key: &str, vbucket: VBucketId) -> Result<Option<QueuedItem>, StorageError>;

    /// Removes all items and the state record of `vbucket`.  Returns false if
    /// the vbucket was unknown.
    fn del_vbucket(&self, vbucket: VBucketId) -> Result<bool, StorageError>;

    /// Lists the state records of all persisted vbuckets.  Malformed records
    /// are skipped with a warning.
    fn list_persisted_vbuckets(
        &self,
    ) -> Result<BTreeMap<VBucketId, PersistedVBucketState>, StorageError>;

    /// Records a state transition of `vbucket`.
    fn vb_state_changed(&self, vbucket: VBucketId, state: VBucketState)
        -> Result<(), StorageError>;

    /// Persists the state records of all vbuckets in `states`.
    fn snapshot_vbuckets(
        &self,
        states: &BTreeMap<VBucketId, PersistedVBucketState>,
    ) -> Result<(), StorageError>;

    /// Streams every persisted item of `vbucket` through `callback`.  Returns
    /// once the last item has been delivered.
    fn dump(&self, vbucket: VBucketId, callback: &mut DumpCallback<'_>) -> Result<(), StorageError>;

    /// Streams every persisted item of every vbucket through `callback`.
    fn dump_all(&self, callback: &mut DumpCallback<'_>) -> Result<(), StorageError>;

    fn storage_properties(&self) -> StorageProperties;

    /// Reorders a flusher queue, sorted by vbucket and key, into per-vbucket
    /// batches.  See [`WriteBatcher::optimize_writes`].
    fn optimize_writes(&self, items: &mut Vec<QueuedItem>);

    /// Reacts to a change of the maximum transaction size.
    fn process_txn_size_change(&self, txn_size: usize);

    /// Changes the number of batches per vbucket.
    fn set_vb_batch_count(&self, batch_count: usize) -> Result<(), StorageError>;

    fn stats(&self) -> KvStoreStats;
}
