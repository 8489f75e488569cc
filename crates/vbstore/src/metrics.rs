//! Engine metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! engine maintains via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};

/// Items queued for replication connections by the in-memory backfill walk.
pub const BACKFILL_ITEMS_FROM_MEMORY: &str = "backfill.items_from_memory";

/// Items queued for replication connections by disk backfill.
pub const BACKFILL_ITEMS_FROM_DISK: &str = "backfill.items_from_disk";

/// Times the backfill walk paused for backpressure.
pub const BACKFILL_PAUSES: &str = "backfill.pauses";

/// Times a disk backfill task was deferred by memory pressure.
pub const DISK_BACKFILL_SNOOZES: &str = "backfill.disk_snoozes";

/// Disk backfill tasks that ran to completion.
pub const DISK_BACKFILLS: &str = "backfill.disk_tasks";

/// Mutations written by the flusher.
pub const FLUSHED_ITEMS: &str = "flusher.items";

/// Time to write one flush batch to the backing store.
pub const FLUSH_DURATION: &str = "flusher.duration";

pub fn describe_metrics() {
    describe_counter!(
        BACKFILL_ITEMS_FROM_MEMORY,
        "total number of backfill items streamed from memory"
    );
    describe_counter!(
        BACKFILL_ITEMS_FROM_DISK,
        "total number of backfill items streamed from disk"
    );
    describe_counter!(BACKFILL_PAUSES, "total number of backfill walk pauses");
    describe_counter!(
        DISK_BACKFILL_SNOOZES,
        "total number of disk backfills deferred by memory pressure"
    );
    describe_counter!(DISK_BACKFILLS, "total number of disk backfills run");
    describe_counter!(FLUSHED_ITEMS, "total number of items flushed");
    describe_histogram!(FLUSH_DURATION, Unit::Seconds, "Time to flush a batch");
}
