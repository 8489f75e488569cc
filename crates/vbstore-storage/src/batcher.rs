//! Write batching for the flusher.
//!
//! The flusher hands the backing store a queue of mutations sorted by vbucket
//! and key.  Committing them in that order lets one busy vbucket monopolize a
//! flush, so [`WriteBatcher::optimize_writes`] cuts each vbucket's run into
//! batches of at most `batch_size` items and interleaves them: the first batch
//! of every vbucket, then the second batch of every vbucket, and so on.

use std::cmp::Ordering;

use tracing::debug;
use vbstore_types::config::StoreConfig;
use vbstore_types::QueuedItem;

use crate::error::StorageError;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WriteBatcher {
    txn_size: usize,
    batch_count: usize,
    batch_size: usize,
    default_batch_size: usize,
}

impl WriteBatcher {
    pub fn new(config: &StoreConfig) -> Self {
        let mut batcher = Self {
            txn_size: config.max_txn_size,
            batch_count: config.vbucket_batch_count.max(1),
            batch_size: config.default_batch_size.max(1),
            default_batch_size: config.default_batch_size.max(1),
        };
        batcher.recompute_batch_size();
        batcher
    }

    /// Maximum number of items of one vbucket in a batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    fn recompute_batch_size(&mut self) {
        let batch_size = self.txn_size / self.batch_count;
        self.batch_size = if batch_size == 0 {
            self.default_batch_size
        } else {
            batch_size
        };
    }

    /// Recomputes the batch size for a new maximum transaction size.
    pub fn process_txn_size_change(&mut self, txn_size: usize) {
        self.txn_size = txn_size;
        self.recompute_batch_size();
        debug!(
            "transaction size changed to {txn_size}, vbucket batch size is now {}",
            self.batch_size
        );
    }

    /// Changes the number of batches per vbucket.  Returns whether the value
    /// changed.
    pub fn set_batch_count(&mut self, batch_count: usize) -> Result<bool, StorageError> {
        if batch_count == 0 {
            return Err(StorageError::InvalidBatchCount(batch_count));
        }
        if batch_count == self.batch_count {
            return Ok(false);
        }
        self.batch_count = batch_count;
        self.recompute_batch_size();
        Ok(true)
    }

    /// Reorders `items` into interleaved per-vbucket batches.
    ///
    /// # Panics
    ///
    /// Panics if `items` is not sorted by vbucket id and key.
    pub fn optimize_writes(&self, items: &mut Vec<QueuedItem>) {
        if items.is_empty() {
            return;
        }
        assert!(
            items.is_sorted_by(|a, b| a.cmp_by_vbucket_and_key(b) != Ordering::Greater),
            "items passed to optimize_writes must be sorted by vbucket and key"
        );

        // `lanes[i]` collects the `i`th batch of every vbucket, in vbucket
        // order.
        let mut lanes: Vec<Vec<QueuedItem>> = Vec::new();
        let mut vbucket = items[0].vbucket();
        let mut lane = 0;
        let mut filled = 0;
        for item in items.drain(..) {
            if item.vbucket() != vbucket {
                vbucket = item.vbucket();
                lane = 0;
                filled = 0;
            } else if filled == self.batch_size {
                lane += 1;
                filled = 0;
            }
            if lane == lanes.len() {
                lanes.push(Vec::new());
            }
            lanes[lane].push(item);
            filled += 1;
        }
        items.extend(lanes.into_iter().flatten());
    }
}
