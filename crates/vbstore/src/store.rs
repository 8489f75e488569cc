//! The engine facade: owns the vbuckets and wires them to the backing store,
//! the replication connections and the background dispatcher.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::metrics::{counter, histogram};
use bytes::Bytes;
use tracing::{debug, info, warn};
use vbstore_storage::KvStore;
use vbstore_types::config::EngineConfig;
use vbstore_types::{PersistedVBucketState, QueueOp, QueuedItem, VBucketId, VBucketState};

use crate::backfill::{BackfillContext, BackfillDriver, BackfillVisitor, VBucketVisitor};
use crate::dispatcher::{Dispatcher, Priority, TaskId};
use crate::error::Error;
use crate::metrics::{FLUSHED_ITEMS, FLUSH_DURATION};
use crate::stats::EpStats;
use crate::tap::{ConnectionRegistry, Notifier, TapConnMap};
use crate::vbucket::{ClientNotifier, VBucket, VBucketFilter, VBucketMap};

/// Checkpoint cursor the flusher reads mutations through.
pub const PERSISTENCE_CURSOR: &str = "persistence";

pub struct EpStore {
    config: EngineConfig,
    stats: Arc<EpStats>,
    vbuckets: Arc<VBucketMap>,
    kvstore: Arc<dyn KvStore>,
    dispatcher: Arc<Dispatcher>,
    tap_conn_map: Arc<TapConnMap>,
    notifier: Arc<Notifier>,
    client_notifier: Arc<dyn ClientNotifier>,
    flush_all: Arc<AtomicBool>,

    /// Origin of engine time.
    started: Instant,
}

impl EpStore {
    pub fn new(
        config: EngineConfig,
        kvstore: Arc<dyn KvStore>,
        client_notifier: Arc<dyn ClientNotifier>,
    ) -> Result<Self, Error> {
        config.validate()?;
        crate::metrics::describe_metrics();
        kvstore.process_txn_size_change(config.store.max_txn_size);
        kvstore.set_vb_batch_count(config.store.vbucket_batch_count)?;

        let stats = Arc::new(EpStats::new(config.store.max_data_size));
        let vbuckets = Arc::new(VBucketMap::new());
        let notifier = Arc::new(Notifier::new());
        let tap_conn_map = Arc::new(TapConnMap::new(vbuckets.clone(), notifier.clone()));
        Ok(Self {
            config,
            stats,
            vbuckets,
            kvstore,
            dispatcher: Arc::new(Dispatcher::new()),
            tap_conn_map,
            notifier,
            client_notifier,
            flush_all: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<EpStats> {
        &self.stats
    }

    pub fn vbuckets(&self) -> &Arc<VBucketMap> {
        &self.vbuckets
    }

    pub fn kvstore(&self) -> &Arc<dyn KvStore> {
        &self.kvstore
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn tap_conn_map(&self) -> &Arc<TapConnMap> {
        &self.tap_conn_map
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Seconds since the engine started.
    pub fn current_time(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn get_vbucket(&self, id: VBucketId) -> Option<Arc<VBucket>> {
        self.vbuckets.get(id)
    }

    fn insert_vbucket(
        &self,
        id: VBucketId,
        state: VBucketState,
        checkpoint_id: u64,
    ) -> Arc<VBucket> {
        let vb = Arc::new(VBucket::new(
            id,
            state,
            self.stats.clone(),
            &self.config.checkpoint,
            state,
            checkpoint_id,
        ));
        vb.checkpoint_manager()
            .set_cursor_to_open_checkpoint(PERSISTENCE_CURSOR);
        self.vbuckets.insert(vb.clone());
        vb
    }

    pub fn create_vbucket(
        &self,
        id: VBucketId,
        state: VBucketState,
    ) -> Result<Arc<VBucket>, Error> {
        if self.vbuckets.get(id).is_some() {
            return Err(Error::VBucketExists(id));
        }
        let vb = self.insert_vbucket(id, state, 0);
        if state == VBucketState::Active {
            vb.checkpoint_manager().set_open_checkpoint_id(2);
        }
        self.kvstore.vb_state_changed(id, state)?;
        Ok(vb)
    }

    /// Moves vbucket `id` to `state`, creating it if needed.
    pub fn set_vbucket_state(&self, id: VBucketId, state: VBucketState) -> Result<(), Error> {
        match self.vbuckets.get(id) {
            Some(vb) => {
                vb.set_state(state, &*self.client_notifier);
                self.kvstore.vb_state_changed(id, state)?;
            }
            None => {
                self.create_vbucket(id, state)?;
            }
        }
        Ok(())
    }

    /// Deletes a dead vbucket from memory and from the backing store.
    pub fn delete_vbucket(&self, id: VBucketId) -> Result<(), Error> {
        let vb = self.vbuckets.get(id).ok_or(Error::UnknownVBucket(id))?;
        let state = vb.state();
        if state != VBucketState::Dead {
            return Err(Error::NotDead { vbucket: id, state });
        }
        self.vbuckets.remove(id);
        self.kvstore.del_vbucket(id)?;
        info!("deleted vbucket {id}");
        Ok(())
    }

    /// Writes the state and open checkpoint id of every vbucket to the
    /// backing store.
    pub fn snapshot_vbucket_states(&self) -> Result<(), Error> {
        let states: BTreeMap<_, _> = self
            .vbuckets
            .ids()
            .into_iter()
            .filter_map(|id| self.vbuckets.get(id))
            .map(|vb| {
                (
                    vb.id(),
                    PersistedVBucketState {
                        state: vb.state(),
                        checkpoint_id: vb.checkpoint_manager().open_checkpoint_id(),
                    },
                )
            })
            .collect();
        self.kvstore.snapshot_vbuckets(&states)?;
        Ok(())
    }

    /// Recreates the persisted vbuckets and loads their items into memory.
    /// Returns the number of items loaded.
    pub fn warmup(&self) -> Result<usize, Error> {
        for (id, persisted) in self.kvstore.list_persisted_vbuckets()? {
            if self.vbuckets.get(id).is_none() {
                self.insert_vbucket(id, persisted.state, persisted.checkpoint_id);
            }
        }
        let mut loaded = 0;
        self.kvstore.dump_all(&mut |item| {
            let (Some(vb), Some(value)) = (self.vbuckets.get(item.vbucket()), item.value()) else {
                return;
            };
            vb.hash_table()
                .set(item.key(), value.clone(), item.row_id());
            loaded += 1;
        })?;
        info!(
            "warmup loaded {loaded} items into {} vbuckets",
            self.vbuckets.len()
        );
        Ok(loaded)
    }

    fn active_vbucket(&self, id: VBucketId) -> Result<Arc<VBucket>, Error> {
        let vb = self.vbuckets.get(id).ok_or(Error::UnknownVBucket(id))?;
        match vb.state() {
            VBucketState::Active => Ok(vb),
            state => {
                vb.vb_stats().ops_reject.incr(1);
                Err(Error::NotMyVBucket { vbucket: id, state })
            }
        }
    }

    fn queue_dirty(&self, vb: &VBucket, item: QueuedItem) {
        let now = self.current_time();
        let item = item.with_queued_at(now);
        vb.do_stats_for_queueing(item.size(), now);
        vb.checkpoint_manager().queue_dirty(item);
    }

    /// Stores `value` under `key` in an active vbucket.
    pub fn set(
        &self,
        vbucket: VBucketId,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<(), Error> {
        let vb = self.active_vbucket(vbucket)?;
        let value = value.into();
        let row_id = vb.hash_table().get(key).map_or(-1, |v| v.row_id());
        if vb.hash_table().set(key, value.clone(), row_id) {
            vb.vb_stats().ops_create.incr(1);
        } else {
            vb.vb_stats().ops_update.incr(1);
        }
        self.queue_dirty(&vb, QueuedItem::with_value(key, value, vbucket, row_id));
        Ok(())
    }

    pub fn get(&self, vbucket: VBucketId, key: &str) -> Result<Option<Bytes>, Error> {
        let vb = self.active_vbucket(vbucket)?;
        let Some(stored) = vb.hash_table().get(key) else {
            return Ok(None);
        };
        match stored.value() {
            Some(value) => Ok(Some(value.clone())),
            None => Ok(self
                .kvstore
                .get(key, vbucket)?
                .and_then(|item| item.value().cloned())),
        }
    }

    /// Deletes `key` from an active vbucket.  Returns false if it did not
    /// exist.
    pub fn del(&self, vbucket: VBucketId, key: &str) -> Result<bool, Error> {
        let vb = self.active_vbucket(vbucket)?;
        let row_id = vb.hash_table().get(key).map_or(-1, |v| v.row_id());
        if !vb.hash_table().del(key) {
            return Ok(false);
        }
        vb.vb_stats().ops_delete.incr(1);
        self.queue_dirty(&vb, QueuedItem::deletion(key, vbucket, row_id));
        Ok(true)
    }

    /// Ejects the value of `key` from memory.  Only persisted items can be
    /// ejected.
    pub fn evict(&self, vbucket: VBucketId, key: &str) -> Result<bool, Error> {
        let vb = self.vbuckets.get(vbucket).ok_or(Error::UnknownVBucket(vbucket))?;
        Ok(vb.hash_table().eject(key))
    }

    /// Applies a mutation received from a replication stream.  While the
    /// vbucket is receiving a backfill, the mutation goes to its backfill
    /// queue; otherwise to its change log.
    pub fn receive_replicated(&self, item: QueuedItem) -> Result<(), Error> {
        let id = item.vbucket();
        let vb = self.vbuckets.get(id).ok_or(Error::UnknownVBucket(id))?;
        match (item.op(), item.value()) {
            (QueueOp::Set, Some(value)) => {
                vb.hash_table().set(item.key(), value.clone(), -1);
            }
            (QueueOp::Del, _) => {
                vb.hash_table().del(item.key());
            }
            _ => return Ok(()),
        }
        if vb.is_backfill_phase() {
            let now = self.current_time();
            let item = item.with_queued_at(now);
            vb.do_stats_for_queueing(item.size(), now);
            vb.queue_backfill_item(item);
        } else {
            self.queue_dirty(&vb, item);
        }
        Ok(())
    }

    /// Marks the start or end of an incoming backfill for vbucket `id`.
    pub fn set_backfill_phase(
        &self,
        id: VBucketId,
        in_backfill_phase: bool,
    ) -> Result<(), Error> {
        let vb = self.vbuckets.get(id).ok_or(Error::UnknownVBucket(id))?;
        vb.set_backfill_phase(in_backfill_phase);
        debug!("vbucket {id} backfill phase: {in_backfill_phase}");
        Ok(())
    }

    /// Writes every queued mutation to the backing store in one transaction.
    /// Returns the number of mutations written.
    ///
    /// Backfilled copies are written before the change log, and only the
    /// latest mutation of each key is kept.  The queues are consumed only
    /// once the transaction commits, so a failed flush is retried in full by
    /// the next one.
    pub fn flush(&self) -> Result<usize, Error> {
        let start = Instant::now();
        let mut drained = Vec::new();
        let mut items = Vec::new();
        for id in self.vbuckets.ids() {
            let Some(vb) = self.vbuckets.get(id) else {
                continue;
            };
            let mut vb_items = vb.backfill_items();
            let backfilled = vb_items.len();
            let (log, end) = vb
                .checkpoint_manager()
                .items_for_cursor(PERSISTENCE_CURSOR);
            vb_items.extend(log);
            if vb_items.is_empty() {
                continue;
            }
            let sizes: Vec<(usize, u64)> = vb_items
                .iter()
                .map(|item| (item.size(), item.queued_at()))
                .collect();
            drained.push((vb, backfilled, end, sizes));
            items.extend(vb_items);
        }
        if items.is_empty() {
            return Ok(0);
        }

        // Stable, so the mutations of a key stay in queue order.
        items.sort_by(QueuedItem::cmp_by_vbucket_and_key);
        let mut latest: Vec<QueuedItem> = Vec::with_capacity(items.len());
        for item in items {
            match latest.last_mut() {
                Some(last) if last.cmp_by_vbucket_and_key(&item) == CmpOrdering::Equal => {
                    *last = item
                }
                _ => latest.push(item),
            }
        }
        let mut items = latest;
        self.kvstore.optimize_writes(&mut items);

        self.kvstore.begin()?;
        let result = items
            .iter()
            .try_for_each(|item| match item.op() {
                QueueOp::Del => self.kvstore.del(item.key(), item.vbucket()),
                _ => self.kvstore.set(item),
            })
            .and_then(|()| self.kvstore.commit());
        if let Err(error) = result {
            self.kvstore.rollback();
            warn!("flush of {} items failed: {error}", items.len());
            return Err(error.into());
        }

        for (vb, backfilled, end, sizes) in drained {
            vb.pop_backfill_items(backfilled);
            if let Some(end) = end {
                vb.checkpoint_manager()
                    .advance_cursor(PERSISTENCE_CURSOR, end);
            }
            for (size, queued_at) in sizes {
                vb.do_stats_for_flushing(size, queued_at);
            }
            vb.checkpoint_manager()
                .remove_closed_unreferenced_checkpoints();
        }

        for item in items.iter().filter(|item| item.op() == QueueOp::Set) {
            let Some(vb) = self.vbuckets.get(item.vbucket()) else {
                continue;
            };
            if let Some(stored) = self.kvstore.get(item.key(), item.vbucket())? {
                vb.hash_table().set_row_id(item.key(), stored.row_id());
            }
        }

        self.stats.flushed_items.incr(items.len());
        counter!(FLUSHED_ITEMS).increment(items.len() as u64);
        histogram!(FLUSH_DURATION).record(start.elapsed().as_secs_f64());
        debug!("flushed {} items", items.len());
        Ok(items.len())
    }

    pub fn set_txn_size(&self, txn_size: usize) {
        self.kvstore.process_txn_size_change(txn_size);
    }

    pub fn set_vb_batch_count(&self, batch_count: usize) -> Result<(), Error> {
        self.kvstore.set_vb_batch_count(batch_count)?;
        Ok(())
    }

    /// Announces that all data is about to be dropped.  Disk backfills do
    /// not start until [`complete_flush_all`](Self::complete_flush_all).
    pub fn schedule_flush_all(&self) {
        self.flush_all.store(true, Ordering::Release);
    }

    pub fn is_flush_all_scheduled(&self) -> bool {
        self.flush_all.load(Ordering::Acquire)
    }

    /// Drops every item from memory and from the backing store.
    pub fn complete_flush_all(&self) -> Result<(), Error> {
        let mut doomed = Vec::new();
        for id in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(id) {
                vb.hash_table().clear();
            }
            self.kvstore
                .dump(id, &mut |item| doomed.push((item.vbucket(), item.key().to_string())))?;
        }
        if !doomed.is_empty() {
            self.kvstore.begin()?;
            for (vbucket, key) in &doomed {
                if let Err(error) = self.kvstore.del(key, *vbucket) {
                    self.kvstore.rollback();
                    return Err(error.into());
                }
            }
            self.kvstore.commit()?;
        }
        self.flush_all.store(false, Ordering::Release);
        info!("flush all removed {} persisted items", doomed.len());
        Ok(())
    }

    pub fn backfill_context(&self) -> BackfillContext {
        BackfillContext {
            config: self.config.tap.clone(),
            stats: self.stats.clone(),
            vbuckets: self.vbuckets.clone(),
            registry: self.tap_conn_map.clone(),
            dispatcher: self.dispatcher.clone(),
            kvstore: self.kvstore.clone(),
            notifier: self.notifier.clone(),
            flush_all: self.flush_all.clone(),
        }
    }

    /// Schedules a walk of every vbucket with `visitor`.
    pub fn visit<V: VBucketVisitor + 'static>(&self, visitor: V, description: &str) -> TaskId {
        let driver = BackfillDriver::new(
            self.vbuckets.clone(),
            visitor,
            Duration::from_secs(self.config.tap.bg_fetch_delay_secs),
            description,
        );
        self.dispatcher.schedule(Box::new(driver), Priority::Backfill)
    }

    /// Starts backfilling the vbuckets selected by `filter` to the replication
    /// connection `name`.
    pub fn start_backfill(&self, name: &str, filter: VBucketFilter) -> Result<TaskId, Error> {
        let token = self
            .tap_conn_map
            .begin_backfill(name)
            .ok_or_else(|| Error::UnknownConnection(name.to_string()))?;
        let efficient_vb_dump = self.kvstore.storage_properties().efficient_vb_dump;
        info!("starting backfill of {filter} for '{name}'");
        let visitor = BackfillVisitor::new(
            self.backfill_context(),
            name,
            token,
            filter,
            efficient_vb_dump,
        );
        Ok(self.visit(visitor, &format!("Backfilling items for '{name}'")))
    }
}
