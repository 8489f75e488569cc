use bytes::Bytes;
use std::cmp::Ordering;

use crate::state::VBucketId;

/// Kind of a queued mutation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueueOp {
    Set,
    Del,
    Flush,
    CheckpointStart,
    CheckpointEnd,
}

/// An item queued for the flusher, for a replication stream, or delivered by
/// a disk dump.
///
/// Items produced by the in-memory backfill walk carry no value: they are
/// "fetch later" markers identifying the key and its storage row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueuedItem {
    key: String,
    value: Option<Bytes>,
    vbucket: VBucketId,
    op: QueueOp,
    row_id: i64,

    /// Engine time, in seconds, at which the item entered a dirty queue.
    queued_at: u64,
}

impl QueuedItem {
    pub fn new(
        key: impl Into<String>,
        value: Option<Bytes>,
        vbucket: VBucketId,
        op: QueueOp,
        row_id: i64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            vbucket,
            op,
            row_id,
            queued_at: 0,
        }
    }

    /// A `Del` record.
    pub fn deletion(key: impl Into<String>, vbucket: VBucketId, row_id: i64) -> Self {
        Self::new(key, None, vbucket, QueueOp::Del, row_id)
    }

    pub fn with_queued_at(mut self, queued_at: u64) -> Self {
        self.queued_at = queued_at;
        self
    }

    /// A `Set` record with no value.
    pub fn key_only(key: impl Into<String>, vbucket: VBucketId, row_id: i64) -> Self {
        Self::new(key, None, vbucket, QueueOp::Set, row_id)
    }

    /// A `Set` record carrying `value`.
    pub fn with_value(
        key: impl Into<String>,
        value: impl Into<Bytes>,
        vbucket: VBucketId,
        row_id: i64,
    ) -> Self {
        Self::new(key, Some(value.into()), vbucket, QueueOp::Set, row_id)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn vbucket(&self) -> VBucketId {
        self.vbucket
    }

    pub fn op(&self) -> QueueOp {
        self.op
    }

    pub fn row_id(&self) -> i64 {
        self.row_id
    }

    pub fn queued_at(&self) -> u64 {
        self.queued_at
    }

    /// True if this item is a "fetch later" marker.
    pub fn is_key_only(&self) -> bool {
        self.op == QueueOp::Set && self.value.is_none()
    }

    /// Bytes accounted against the dirty queue for this item.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Bytes::len)
    }

    /// Orders items by vbucket id, then key.
    pub fn cmp_by_vbucket_and_key(&self, other: &Self) -> Ordering {
        self.vbucket
            .cmp(&other.vbucket)
            .then_with(|| self.key.cmp(&other.key))
    }
}
