//! The vbucket: one shard of the key space, with its in-memory items, change
//! log, backfill queue and the clients waiting for it to become active.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::mem::size_of;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam::sync::ShardedLock;
use tracing::{debug, info, warn};
use vbstore_types::config::CheckpointConfig;
use vbstore_types::{QueuedItem, VBucketId, VBucketState};

use crate::stats::{EpStats, StatCounter};

mod checkpoint;
mod filter;
mod hash_table;

pub use checkpoint::{CheckpointManager, CursorPosition};
pub use filter::VBucketFilter;
pub use hash_table::{HashTable, HashTableVisitor, StoredValue};

/// Opaque handle of a client connection blocked on a vbucket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientCookie(pub u64);

impl Display for ClientCookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "cookie#{}", self.0)
    }
}

/// Outcome delivered to a blocked client when it is released.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Success,
    NotMyVBucket,
}

/// Wakes client connections blocked on a vbucket.
pub trait ClientNotifier: Send + Sync {
    fn notify_io_complete(&self, cookie: ClientCookie, status: EngineStatus);
}

/// Lowest open checkpoint id of an active vbucket.  Id 1 is reserved for the
/// checkpoint a replica starts receiving into.
const MIN_ACTIVE_CHECKPOINT_ID: u64 = 2;

#[derive(Debug, Default)]
struct PendingOps {
    cookies: Vec<ClientCookie>,

    /// When the first of `cookies` started waiting.
    since: Option<Instant>,
}

#[derive(Debug, Default)]
struct BackfillQueue {
    items: VecDeque<QueuedItem>,
    in_backfill_phase: bool,
}

/// Per-vbucket operation and dirty queue counters.
#[derive(Debug, Default)]
pub struct VBucketStats {
    pub ops_create: StatCounter,
    pub ops_update: StatCounter,
    pub ops_delete: StatCounter,
    pub ops_reject: StatCounter,

    /// Items waiting to be flushed.
    pub dirty_queue_size: StatCounter,
    /// Bytes waiting to be flushed.
    pub dirty_queue_mem: StatCounter,
    /// Items ever queued.
    pub dirty_queue_fill: StatCounter,
    /// Items ever flushed.
    pub dirty_queue_drain: StatCounter,
    /// Sum of the enqueue times, in seconds, of the queued items.
    pub dirty_queue_age: StatCounter,
    pub dirty_queue_pending_writes: StatCounter,
}

impl VBucketStats {
    fn reset(&self) {
        self.ops_create.set(0);
        self.ops_update.set(0);
        self.ops_delete.set(0);
        self.ops_reject.set(0);
    }
}

pub struct VBucket {
    id: VBucketId,
    state: AtomicU8,
    initial_state: VBucketState,
    hash_table: HashTable,
    checkpoint_manager: CheckpointManager,
    backfill: Mutex<BackfillQueue>,
    pending_ops: Mutex<PendingOps>,
    vb_stats: VBucketStats,
    stats: Arc<EpStats>,
}

impl VBucket {
    pub fn new(
        id: VBucketId,
        state: VBucketState,
        stats: Arc<EpStats>,
        checkpoint_config: &CheckpointConfig,
        initial_state: VBucketState,
        checkpoint_id: u64,
    ) -> Self {
        let vbucket = Self {
            id,
            state: AtomicU8::new(state as u8),
            initial_state,
            hash_table: HashTable::new(stats.clone()),
            checkpoint_manager: CheckpointManager::new(id, checkpoint_config, checkpoint_id),
            backfill: Mutex::new(BackfillQueue::default()),
            pending_ops: Mutex::new(PendingOps::default()),
            vb_stats: VBucketStats::default(),
            stats,
        };
        vbucket.stats.mem_overhead.incr(Self::overhead());
        debug!("created vbucket {id} in state {state}");
        vbucket
    }

    fn overhead() -> usize {
        size_of::<Self>() + HashTable::memory_size() + size_of::<CheckpointManager>()
    }

    pub fn id(&self) -> VBucketId {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        // Only valid discriminants are ever stored.
        VBucketState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(VBucketState::Dead)
    }

    /// State the vbucket was loaded or created in.
    pub fn initial_state(&self) -> VBucketState {
        self.initial_state
    }

    pub fn hash_table(&self) -> &HashTable {
        &self.hash_table
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    pub fn vb_stats(&self) -> &VBucketStats {
        &self.vb_stats
    }

    /// Number of items in memory, resident or not.
    pub fn size(&self) -> usize {
        struct Depth(usize);
        impl HashTableVisitor for Depth {
            fn visit(&mut self, _value: &StoredValue) {
                self.0 += 1;
            }
        }
        let mut depth = Depth(0);
        self.hash_table.visit(&mut depth);
        depth.0
    }

    /// Transitions to `to` and releases the blocked clients if `to` is not
    /// `Pending`.  Returns the previous state.
    pub fn set_state(&self, to: VBucketState, notifier: &dyn ClientNotifier) -> VBucketState {
        let old = VBucketState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
            .unwrap_or(VBucketState::Dead);
        if to == VBucketState::Active
            && self.checkpoint_manager.open_checkpoint_id() < MIN_ACTIVE_CHECKPOINT_ID
        {
            self.checkpoint_manager
                .set_open_checkpoint_id(MIN_ACTIVE_CHECKPOINT_ID);
        }
        info!("transitioning vbucket {} from {old} to {to}", self.id);
        self.fire_all_ops(notifier);
        old
    }

    /// Parks `cookie` until the vbucket leaves the pending state.  Returns
    /// false, without parking, if the vbucket is not pending.
    pub fn add_pending_op(&self, cookie: ClientCookie) -> bool {
        let mut pending = self.pending_ops.lock().unwrap();
        if self.state() != VBucketState::Pending {
            return false;
        }
        if pending.cookies.is_empty() {
            pending.since = Some(Instant::now());
        }
        pending.cookies.push(cookie);
        self.stats.pending_ops.incr(1);
        self.stats.pending_ops_total.incr(1);
        true
    }

    pub fn num_pending_ops(&self) -> usize {
        self.pending_ops.lock().unwrap().cookies.len()
    }

    /// Releases every blocked client: with success if the vbucket is active,
    /// with "not my vbucket" if it is a replica or dead.  Does nothing while
    /// the vbucket is pending.
    pub fn fire_all_ops(&self, notifier: &dyn ClientNotifier) {
        let mut pending = self.pending_ops.lock().unwrap();
        let status = match self.state() {
            VBucketState::Pending => return,
            VBucketState::Active => EngineStatus::Success,
            VBucketState::Replica | VBucketState::Dead => EngineStatus::NotMyVBucket,
        };
        let Some(since) = pending.since.take() else {
            return;
        };

        let elapsed = since.elapsed().as_micros();
        self.stats.pending_ops_histo.record(elapsed);
        self.stats
            .pending_ops_max_duration
            .set_if_bigger(usize::try_from(elapsed).unwrap_or(usize::MAX));

        let cookies = std::mem::take(&mut pending.cookies);
        self.stats.pending_ops_max.set_if_bigger(cookies.len());
        self.stats.pending_ops.decr(cookies.len());
        debug!(
            "vbucket {}: releasing {} blocked clients with {status:?}",
            self.id,
            cookies.len()
        );
        for cookie in cookies {
            notifier.notify_io_complete(cookie, status);
        }
    }

    pub fn queue_backfill_item(&self, item: QueuedItem) {
        self.stats.mem_overhead.incr(size_of::<QueuedItem>());
        self.backfill.lock().unwrap().items.push_back(item);
    }

    /// Copies of the queued backfill items, oldest first.
    pub fn backfill_items(&self) -> Vec<QueuedItem> {
        self.backfill.lock().unwrap().items.iter().cloned().collect()
    }

    /// Removes the `n` oldest backfill items, once they are persisted.
    pub fn pop_backfill_items(&self, n: usize) {
        let mut backfill = self.backfill.lock().unwrap();
        let n = n.min(backfill.items.len());
        backfill.items.drain(..n);
        self.stats.mem_overhead.decr(n * size_of::<QueuedItem>());
    }

    pub fn backfill_size(&self) -> usize {
        self.backfill.lock().unwrap().items.len()
    }

    pub fn is_backfill_phase(&self) -> bool {
        self.backfill.lock().unwrap().in_backfill_phase
    }

    pub fn set_backfill_phase(&self, in_backfill_phase: bool) {
        self.backfill.lock().unwrap().in_backfill_phase = in_backfill_phase;
    }

    /// Accounts for an item entering the dirty queue at `queued_at` seconds.
    pub fn do_stats_for_queueing(&self, item_bytes: usize, queued_at: u64) {
        self.vb_stats.dirty_queue_size.incr(1);
        self.vb_stats.dirty_queue_mem.incr(item_bytes);
        self.vb_stats.dirty_queue_fill.incr(1);
        self.vb_stats.dirty_queue_age.incr(queued_at as usize);
        self.vb_stats.dirty_queue_pending_writes.incr(item_bytes);
    }

    /// Accounts for an item, queued at `queued_at` seconds, being flushed.
    pub fn do_stats_for_flushing(&self, item_bytes: usize, queued_at: u64) {
        self.vb_stats.dirty_queue_size.decr(1);
        self.vb_stats.dirty_queue_mem.decr(item_bytes);
        self.vb_stats.dirty_queue_drain.incr(1);
        self.vb_stats.dirty_queue_age.decr(queued_at as usize);
        self.vb_stats.dirty_queue_pending_writes.decr(item_bytes);
    }

    /// Total time the queued items have been waiting, in milliseconds, as of
    /// `now` seconds.
    pub fn queue_age_ms(&self, now: u64) -> u64 {
        let size = self.vb_stats.dirty_queue_size.get() as u64;
        let age = self.vb_stats.dirty_queue_age.get() as u64;
        (now * size).saturating_sub(age) * 1000
    }

    pub fn reset_stats(&self) {
        self.vb_stats.reset();
    }
}

impl fmt::Debug for VBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("VBucket")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("items", &self.hash_table.num_items())
            .finish_non_exhaustive()
    }
}

impl Drop for VBucket {
    fn drop(&mut self) {
        let pending = self.pending_ops.get_mut().unwrap();
        if !pending.cookies.is_empty() {
            warn!(
                "dropping vbucket {} with {} clients still blocked on it",
                self.id,
                pending.cookies.len()
            );
            self.stats.pending_ops.decr(pending.cookies.len());
        }
        let queued = self.backfill.get_mut().unwrap().items.len();
        self.stats
            .mem_overhead
            .decr(Self::overhead() + queued * size_of::<QueuedItem>());
        debug!("destroyed vbucket {}", self.id);
    }
}

/// The vbuckets of an engine, by id.
#[derive(Debug, Default)]
pub struct VBucketMap {
    vbuckets: ShardedLock<BTreeMap<VBucketId, Arc<VBucket>>>,
}

impl VBucketMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: VBucketId) -> Option<Arc<VBucket>> {
        self.vbuckets.read().unwrap().get(&id).cloned()
    }

    /// Adds `vbucket`, replacing and returning any vbucket with the same id.
    pub fn insert(&self, vbucket: Arc<VBucket>) -> Option<Arc<VBucket>> {
        self.vbuckets.write().unwrap().insert(vbucket.id(), vbucket)
    }

    pub fn remove(&self, id: VBucketId) -> Option<Arc<VBucket>> {
        self.vbuckets.write().unwrap().remove(&id)
    }

    /// Ids of all vbuckets, ascending.
    pub fn ids(&self) -> Vec<VBucketId> {
        self.vbuckets.read().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.vbuckets.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vbuckets.read().unwrap().is_empty()
    }
}
