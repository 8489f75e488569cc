use std::{
    ops::RangeInclusive,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

const N_BUCKETS: usize = 65;

/// A latency histogram with power-of-two buckets.
///
/// Bucket 0 holds the value 0 and bucket `i` (for `i >= 1`) holds values in
/// `2^(i-1)..=2^i - 1`.  All updates are relaxed atomics, so the histogram can
/// be shared without locking.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; N_BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; N_BUCKETS],
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Records `value`.  Values that don't fit in a `u64` are ignored.
    pub fn record(&self, value: impl TryInto<u64>) {
        if let Ok(value) = value.try_into() {
            self.buckets[bucket_of(value)].fetch_add(1, Ordering::Relaxed);
            self.count.fetch_add(1, Ordering::Relaxed);
            self.sum.fetch_add(value, Ordering::Relaxed);
            self.max.fetch_max(value, Ordering::Relaxed);
        }
    }

    /// Records the microseconds elapsed since `start`.
    pub fn record_elapsed(&self, start: Instant) {
        self.record(start.elapsed().as_micros());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Returns the non-empty buckets.
    pub fn nonempty_buckets(&self) -> Vec<(RangeInclusive<u64>, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| {
                let count = bucket.load(Ordering::Relaxed);
                (count > 0).then(|| (bucket_range(index), count))
            })
            .collect()
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_of(value: u64) -> usize {
    (u64::BITS - value.leading_zeros()) as usize
}

fn bucket_range(bucket: usize) -> RangeInclusive<u64> {
    match bucket {
        0 => 0..=0,
        64 => 1 << 63..=u64::MAX,
        _ => 1 << (bucket - 1)..=(1 << bucket) - 1,
    }
}
