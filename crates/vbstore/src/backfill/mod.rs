//! Backfill: building a full snapshot of a set of vbuckets for a replication
//! connection.
//!
//! A [`BackfillDriver`] walks the vbuckets one at a time with a
//! [`BackfillVisitor`].  For each vbucket the visitor either streams the
//! items from memory or, when most of the vbucket has been ejected and the
//! backing store can dump a single vbucket cheaply, hands the non-resident
//! part to a [`DiskBackfillTask`].  Both paths back off under memory
//! pressure; the walk also pauses while the connection's queue is too deep.
//! The connection sees a single [`BackfillComplete`] once the walk and all
//! of its disk tasks have finished.
//!
//! [`BackfillComplete`]: crate::tap::TapEvent::BackfillComplete

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vbstore_storage::KvStore;
use vbstore_types::config::TapConfig;

use crate::dispatcher::Dispatcher;
use crate::stats::EpStats;
use crate::tap::{ConnectionRegistry, Notifier};
use crate::vbucket::{HashTableVisitor, VBucket, VBucketMap};

mod disk;
mod driver;
mod visitor;

pub use disk::{DiskBackfillState, DiskBackfillTask};
pub use driver::BackfillDriver;
pub use visitor::BackfillVisitor;

/// A walk over vbuckets driven by [`BackfillDriver`].
pub trait VBucketVisitor: HashTableVisitor + Send {
    /// Called on entering a vbucket.  Returns true to walk its hash table.
    fn visit_bucket(&mut self, vbucket: &Arc<VBucket>) -> bool;

    /// Called before each vbucket.  Returns true to pause the walk for a
    /// while.
    fn pause_visitor(&mut self) -> bool {
        false
    }

    /// A visitor that turned invalid is abandoned without completing.
    fn is_valid(&self) -> bool {
        true
    }

    /// Called once after the last vbucket.
    fn complete(&mut self) {}
}

/// Everything backfill tasks need from the engine.
#[derive(Clone)]
pub struct BackfillContext {
    pub config: TapConfig,
    pub stats: Arc<EpStats>,
    pub vbuckets: Arc<VBucketMap>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub kvstore: Arc<dyn KvStore>,
    pub notifier: Arc<Notifier>,

    /// Set while a flush of all data is scheduled.
    pub flush_all: Arc<AtomicBool>,
}

impl BackfillContext {
    pub fn is_memory_usage_too_high(&self) -> bool {
        self.stats
            .is_memory_usage_too_high(self.config.backfill_mem_threshold)
    }

    pub fn is_flush_all_scheduled(&self) -> bool {
        self.flush_all.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use vbstore_storage::{KvStore, MemoryKvStore, StorageProperties};
    use vbstore_types::config::{EngineConfig, NonResidentPolicy};
    use vbstore_types::{VBucketId, VBucketState};

    use super::{DiskBackfillState, DiskBackfillTask};
    use crate::dispatcher::{Task, TaskResult};
    use crate::tap::{ConnectionRegistry, TapEvent};
    use crate::test::{init_test_logger, test_store, TestClientNotifier};
    use crate::vbucket::VBucketFilter;
    use crate::EpStore;

    const CONN: &str = "replica";

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.tap.bg_fetch_delay_secs = 0;
        config
    }

    fn key(i: usize) -> String {
        format!("key-{i:03}")
    }

    /// Creates active vbucket `vb` with `n` persisted items, the first
    /// `evicted` of which are ejected from memory.
    fn populate(store: &EpStore, vb: VBucketId, n: usize, evicted: usize) {
        store.create_vbucket(vb, VBucketState::Active).unwrap();
        for i in 0..n {
            store.set(vb, &key(i), format!("value-{i}")).unwrap();
        }
        store.flush().unwrap();
        for i in 0..evicted {
            assert!(store.evict(vb, &key(i)).unwrap());
        }
    }

    /// `(vbucket, key, from_disk)` of each queued mutation, and the number of
    /// completion markers.
    fn summarize(events: &[TapEvent]) -> (Vec<(VBucketId, String, bool)>, usize) {
        let mut mutations = Vec::new();
        let mut completions = 0;
        for event in events {
            match event {
                TapEvent::Mutation(item) => mutations.push((
                    item.vbucket(),
                    item.key().to_string(),
                    !item.is_key_only(),
                )),
                TapEvent::BackfillComplete => completions += 1,
            }
        }
        (mutations, completions)
    }

    #[test]
    fn resident_vbucket_streams_from_memory() {
        let (store, _) = test_store(config());
        populate(&store, 0, 3, 0);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();
        store.dispatcher().run_until_idle();

        let events = store.tap_conn_map().drain_events(CONN);
        assert_eq!(events.last(), Some(&TapEvent::BackfillComplete));
        let (mutations, completions) = summarize(&events);
        assert_eq!(
            mutations,
            (0..3).map(|i| (0, key(i), false)).collect::<Vec<_>>()
        );
        assert_eq!(completions, 1);
        for event in &events {
            if let TapEvent::Mutation(item) = event {
                assert!(item.row_id() >= 0);
            }
        }
        assert_eq!(store.stats().backfill_items_from_memory.get(), 3);
        assert!(store.notifier().wakeups() >= 1);
    }

    #[test]
    fn low_residency_vbucket_gets_disk_pass() {
        let (store, _) = test_store(config());
        populate(&store, 1, 4, 0);
        populate(&store, 2, 10, 6);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();
        store.dispatcher().run_until_idle();

        let events = store.tap_conn_map().drain_events(CONN);
        let (mutations, completions) = summarize(&events);
        assert_eq!(completions, 1);
        assert_eq!(events.last(), Some(&TapEvent::BackfillComplete));

        let expected: Vec<_> = (0..4)
            .map(|i| (1, key(i), false))
            .chain((6..10).map(|i| (2, key(i), false)))
            .chain((0..6).map(|i| (2, key(i), true)))
            .collect();
        assert_eq!(mutations, expected);
        assert_eq!(store.stats().backfill_items_from_disk.get(), 6);

        let status = store.tap_conn_map().status(CONN).unwrap();
        assert_eq!(status.disk_backfill_counter, 0);
        assert!(status.backfill_completed);
        assert_eq!(status.checkpoint_cursors.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn filter_and_empty_vbuckets() {
        let (store, _) = test_store(config());
        populate(&store, 0, 2, 0);
        populate(&store, 1, 2, 0);
        store.create_vbucket(3, VBucketState::Active).unwrap();
        store.tap_conn_map().new_producer(CONN);
        store
            .start_backfill(CONN, VBucketFilter::new([1, 3]))
            .unwrap();
        store.dispatcher().run_until_idle();

        let (mutations, completions) = summarize(&store.tap_conn_map().drain_events(CONN));
        assert_eq!(mutations, vec![(1, key(0), false), (1, key(1), false)]);
        assert_eq!(completions, 1);

        let has_cursor = |vb| {
            store
                .get_vbucket(vb)
                .unwrap()
                .checkpoint_manager()
                .has_cursor(CONN)
        };
        assert!(!has_cursor(0));
        assert!(has_cursor(1));
        assert!(!has_cursor(3));
    }

    fn run_policy(policy: NonResidentPolicy) -> Vec<(VBucketId, String, bool)> {
        init_test_logger();
        let mut config = config();
        config.tap.backfill_non_resident = policy;
        let kvstore = Arc::new(MemoryKvStore::new(&config.store).with_properties(
            StorageProperties {
                efficient_vb_dump: false,
                ..MemoryKvStore::new(&config.store).storage_properties()
            },
        ));
        let store = EpStore::new(config, kvstore, Arc::new(TestClientNotifier::default())).unwrap();
        populate(&store, 0, 4, 2);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();
        store.dispatcher().run_until_idle();
        let (mutations, completions) = summarize(&store.tap_conn_map().drain_events(CONN));
        assert_eq!(completions, 1);
        assert_eq!(store.stats().backfill_items_from_disk.get(), 0);
        mutations
    }

    #[test]
    fn non_resident_policy_without_disk_dump() {
        assert_eq!(
            run_policy(NonResidentPolicy::Omit),
            vec![(0, key(2), false), (0, key(3), false)]
        );
        assert_eq!(
            run_policy(NonResidentPolicy::FetchLater),
            (0..4).map(|i| (0, key(i), false)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn backlog_pauses_walk() {
        let mut config = config();
        config.tap.backfill_backlog_limit = 2;
        let (store, _) = test_store(config);
        for vb in 0..3 {
            populate(&store, vb, 3, 0);
        }
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();

        // Visits vbucket 0, then vbucket 1, which flushes vbucket 0's items.
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.stats().backfill_pauses.get(), 0);

        // Three queued items exceed the limit.
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.stats().backfill_pauses.get(), 1);
        assert_eq!(store.tap_conn_map().drain_events(CONN).len(), 3);

        store.dispatcher().run_until_idle();
        let (mutations, completions) = summarize(&store.tap_conn_map().drain_events(CONN));
        assert_eq!(mutations.len(), 6);
        assert_eq!(completions, 1);
    }

    #[test]
    fn memory_pressure_defers_walk_and_disk_pass() {
        let (store, _) = test_store(config());
        populate(&store, 0, 10, 8);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();

        store.stats().max_data_size.set(1);
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.stats().backfill_pauses.get(), 1);
        assert_eq!(store.tap_conn_map().backfill_queue_depth(CONN), 0);

        // The walk finishes and leaves the disk pass behind.
        store.stats().max_data_size.set(0);
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.dispatcher().len(), 1);

        store.stats().max_data_size.set(1);
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.stats().disk_backfill_snoozes.get(), 1);
        let status = store.tap_conn_map().status(CONN).unwrap();
        assert_eq!(status.disk_backfill_counter, 1);
        assert!(!status.backfill_completed);
        assert_eq!(store.stats().backfill_items_from_disk.get(), 0);

        store.stats().max_data_size.set(0);
        store.dispatcher().run_until_idle();
        let (mutations, completions) = summarize(&store.tap_conn_map().drain_events(CONN));
        assert_eq!(mutations.len(), 10);
        assert_eq!(completions, 1);
    }

    #[test]
    fn disconnect_stops_backfill() {
        let (store, _) = test_store(config());
        populate(&store, 0, 3, 0);
        populate(&store, 1, 3, 0);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();

        assert_eq!(store.dispatcher().run_ready(), 1);
        store.tap_conn_map().disconnect(CONN);
        store.dispatcher().run_until_idle();

        assert!(store.dispatcher().is_empty());
        assert_eq!(store.stats().backfill_items_from_memory.get(), 0);
        let status = store.tap_conn_map().status(CONN).unwrap();
        assert!(!status.backfill_completed);
        assert_eq!(status.queued_events, 0);
    }

    #[test]
    fn reconnect_invalidates_running_backfill() {
        let (store, _) = test_store(config());
        populate(&store, 0, 10, 9);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();

        // The walk completes; the disk pass is still queued.
        assert_eq!(store.dispatcher().run_ready(), 1);
        store.tap_conn_map().drain_events(CONN);
        store.tap_conn_map().new_producer(CONN);
        store.dispatcher().run_until_idle();

        assert_eq!(store.tap_conn_map().drain_events(CONN), vec![]);
        assert_eq!(store.stats().backfill_items_from_disk.get(), 0);
    }

    #[test]
    fn flush_all_skips_disk_pass() {
        let (store, _) = test_store(config());
        populate(&store, 0, 10, 9);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();
        assert_eq!(store.dispatcher().run_ready(), 1);

        store.schedule_flush_all();
        store.dispatcher().run_until_idle();

        let (mutations, completions) = summarize(&store.tap_conn_map().drain_events(CONN));
        assert_eq!(mutations, vec![(0, key(9), false)]);
        assert_eq!(completions, 0);
        let status = store.tap_conn_map().status(CONN).unwrap();
        assert_eq!(status.disk_backfill_counter, 0);
        assert_eq!(status.items_from_disk, 0);
    }

    #[test]
    fn stale_disk_task_leaves_new_backfill_alone() {
        let (store, _) = test_store(config());
        populate(&store, 0, 10, 9);
        populate(&store, 1, 10, 9);
        let old = store.tap_conn_map().new_producer(CONN);
        store.tap_conn_map().new_producer(CONN);
        store.start_backfill(CONN, VBucketFilter::all()).unwrap();

        // Both vbuckets walked, both disk passes queued.
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.dispatcher().run_ready(), 1);
        assert_eq!(store.tap_conn_map().status(CONN).unwrap().disk_backfill_counter, 2);

        let mut stale =
            DiskBackfillTask::new(store.backfill_context(), CONN, old, 0, HashSet::new());
        assert_eq!(stale.run(), TaskResult::Done);
        assert_eq!(stale.state(), DiskBackfillState::Done);
        let status = store.tap_conn_map().status(CONN).unwrap();
        assert_eq!(status.disk_backfill_counter, 2);
        assert!(!status.backfill_completed);

        store.dispatcher().run_until_idle();
        let events = store.tap_conn_map().drain_events(CONN);
        assert_eq!(events.len(), 21);
        assert_eq!(events.last(), Some(&TapEvent::BackfillComplete));
        let (mutations, completions) = summarize(&events);
        assert_eq!(completions, 1);
        assert_eq!(mutations.iter().filter(|(_, _, from_disk)| *from_disk).count(), 18);
    }

    #[test]
    fn walk_without_items_only_signals_completion() {
        let (store, _) = test_store(config());
        store.create_vbucket(0, VBucketState::Active).unwrap();
        populate(&store, 1, 3, 0);
        store.tap_conn_map().new_producer(CONN);
        let wakeups = store.notifier().wakeups();

        store.start_backfill(CONN, VBucketFilter::new([0])).unwrap();
        store.dispatcher().run_until_idle();

        assert_eq!(
            store.tap_conn_map().drain_events(CONN),
            vec![TapEvent::BackfillComplete]
        );
        assert_eq!(store.notifier().wakeups(), wakeups + 1);
        assert_eq!(store.stats().backfill_items_from_memory.get(), 0);
        let status = store.tap_conn_map().status(CONN).unwrap();
        assert!(status.checkpoint_cursors.is_empty());
        assert_eq!(status.disk_backfill_counter, 0);
    }

    #[test]
    fn unknown_connection() {
        let (store, _) = test_store(config());
        assert_eq!(
            store.start_backfill("nobody", VBucketFilter::all()),
            Err(crate::Error::UnknownConnection("nobody".to_string()))
        );
    }
}
