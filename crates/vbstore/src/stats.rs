//! Process-wide engine statistics.
//!
//! An [`EpStats`] handle is created once and shared by every component that
//! reads or mutates the counters.  All counters are relaxed atomics: readers
//! such as the backpressure checks see eventually-consistent snapshots.

use std::sync::atomic::{AtomicUsize, Ordering};

use vbstore_storage::histogram::LatencyHistogram;

/// Values at or above this bound indicate that a counter wrapped around.
const GIGANTOR: usize = 1 << (usize::BITS - 1);

/// An unsigned statistic that must never go negative.
///
/// Every mutation checks the invariant: decrementing below zero, or
/// incrementing into the wrapped-around range, is an accounting bug and
/// panics.
#[derive(Debug, Default)]
pub struct StatCounter(AtomicUsize);

impl StatCounter {
    pub const fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Adds `by` and returns the new value.
    pub fn incr(&self, by: usize) -> usize {
        let value = self.0.fetch_add(by, Ordering::Relaxed).wrapping_add(by);
        assert!(value < GIGANTOR, "statistic overflowed: {value}");
        value
    }

    /// Subtracts `by` and returns the new value.
    pub fn decr(&self, by: usize) -> usize {
        match self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(by))
        {
            Ok(old) => old - by,
            Err(current) => panic!("statistic would go negative: {current} - {by}"),
        }
    }

    /// Raises the value to `value` if it is currently smaller.
    pub fn set_if_bigger(&self, value: usize) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }
}

/// Engine-wide statistics.
#[derive(Debug, Default)]
pub struct EpStats {
    /// Bytes of item data held in memory.
    pub current_size: StatCounter,

    /// Bytes used by engine data structures other than item data.
    pub mem_overhead: StatCounter,

    /// Memory quota for item data.  Zero means unlimited.
    pub max_data_size: StatCounter,

    /// Clients currently blocked on a pending vbucket.
    pub pending_ops: StatCounter,

    /// Clients ever blocked on a pending vbucket.
    pub pending_ops_total: StatCounter,

    /// Largest number of clients released at once.
    pub pending_ops_max: StatCounter,

    /// Longest time clients waited on a pending vbucket, in microseconds.
    pub pending_ops_max_duration: StatCounter,

    /// Time clients waited on a pending vbucket, in microseconds.
    pub pending_ops_histo: LatencyHistogram,

    /// Items delivered to replication connections by in-memory backfill.
    pub backfill_items_from_memory: StatCounter,

    /// Items delivered to replication connections by disk backfill.
    pub backfill_items_from_disk: StatCounter,

    /// Times a disk backfill task was deferred by memory pressure.
    pub disk_backfill_snoozes: StatCounter,

    /// Times the backfill walk paused between vbuckets.
    pub backfill_pauses: StatCounter,

    /// Mutations written to the backing store.
    pub flushed_items: StatCounter,
}

impl EpStats {
    pub fn new(max_data_size: usize) -> Self {
        let stats = Self::default();
        stats.max_data_size.set(max_data_size);
        stats
    }

    /// Bytes in use: item data plus overhead.
    pub fn memory_used(&self) -> usize {
        self.current_size.get() + self.mem_overhead.get()
    }

    /// Returns true if memory use exceeds `threshold` times the quota.  Never
    /// true without a quota.
    pub fn is_memory_usage_too_high(&self, threshold: f64) -> bool {
        let max_size = self.max_data_size.get();
        if max_size == 0 {
            return false;
        }
        self.memory_used() as f64 > max_size as f64 * threshold
    }
}
