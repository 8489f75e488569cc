//! Replication ("TAP") connections.
//!
//! A [`TapConnMap`] owns the producer side of every named replication
//! connection: the outgoing event queue, the backfill bookkeeping used to
//! detect when a connection's snapshot is complete, and the checkpoint
//! cursors the incremental stream reads from.  Backfill code only talks to
//! connections through the [`ConnectionRegistry`] trait.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::sync::Unparker;
use tracing::{debug, info, warn};
use vbstore_types::{QueuedItem, VBucketId};

use crate::vbucket::VBucketMap;

/// Identifies one incarnation of a named connection.  A reconnect under the
/// same name gets a new token, invalidating work started for the old one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionToken(u64);

/// An operation applied to a named connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapOp {
    /// Queue an item read from disk.
    ReceivedItem(QueuedItem),

    /// Wake the connection if it is waiting for items.
    NotifyPaused,

    /// A disk backfill task was scheduled.
    ScheduleDiskBackfill,

    /// A disk backfill task finished, successfully or not.
    CompleteDiskBackfill,

    /// Move the connection's checkpoint cursor on the vbucket to the start of
    /// its open checkpoint.
    SetCursorToCheckpointStart(VBucketId),

    /// The in-memory backfill walk finished.
    CompleteBackfill,
}

/// An event in a connection's outgoing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapEvent {
    Mutation(QueuedItem),

    /// The connection's backfill snapshot is complete.  Sent once.
    BackfillComplete,
}

/// The view of replication connections used by backfill.
pub trait ConnectionRegistry: Send + Sync {
    /// Marks `name` as having a backfill in progress.  Returns the token of
    /// the connection, or `None` if there is no such connected producer.
    fn begin_backfill(&self, name: &str) -> Option<ConnectionToken>;

    /// Returns true if `name` is connected and still has `token`.
    fn is_connected(&self, name: &str, token: ConnectionToken) -> bool;

    /// Applies `op` to `name`.  Returns false if the connection is gone or
    /// no longer has `token`, in which case the operation had no effect.
    fn perform_op(&self, name: &str, token: ConnectionToken, op: TapOp) -> bool;

    /// Number of events queued for `name`, or a negative number if the
    /// connection is gone.
    fn backfill_queue_depth(&self, name: &str) -> i64;

    /// Appends `items` to the outgoing queue of `name` as one batch, unless
    /// the connection no longer has `token`.
    fn set_events(&self, name: &str, token: ConnectionToken, items: Vec<QueuedItem>) -> bool;

    /// Returns true exactly once per backfill: the first time it is called
    /// after the in-memory walk and every disk task of `name` finished.
    /// Queues [`TapEvent::BackfillComplete`] when it does.  Always false if
    /// the connection no longer has `token`.
    fn check_backfill_completion(&self, name: &str, token: ConnectionToken) -> bool;
}

/// Wakes the thread that pushes queued events to connections.
#[derive(Debug, Default)]
pub struct Notifier {
    wakeups: AtomicU64,
    unparker: Mutex<Option<Unparker>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unparks `unparker` on every notification.
    pub fn attach(&self, unparker: Unparker) {
        *self.unparker.lock().unwrap() = Some(unparker);
    }

    pub fn notify(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        if let Some(unparker) = self.unparker.lock().unwrap().as_ref() {
            unparker.unpark();
        }
    }

    /// Number of notifications so far.
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct TapProducer {
    token: ConnectionToken,
    connected: bool,
    paused: bool,
    queue: VecDeque<TapEvent>,

    /// The in-memory walk has not finished yet.
    pending_backfill: bool,
    /// Disk backfill tasks scheduled and not yet finished.
    disk_backfill_counter: usize,
    /// [`TapEvent::BackfillComplete`] was queued for the current backfill.
    backfill_completed: bool,

    /// Open checkpoint id each vbucket's cursor was rewound to.
    checkpoint_cursors: BTreeMap<VBucketId, u64>,
    items_from_disk: u64,
    paused_wakeups: u64,
}

impl TapProducer {
    fn new(token: ConnectionToken) -> Self {
        Self {
            token,
            connected: true,
            paused: false,
            queue: VecDeque::new(),
            pending_backfill: false,
            disk_backfill_counter: 0,
            backfill_completed: false,
            checkpoint_cursors: BTreeMap::new(),
            items_from_disk: 0,
            paused_wakeups: 0,
        }
    }
}

/// Status of one producer, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerStatus {
    pub connected: bool,
    pub paused: bool,
    pub queued_events: usize,
    pub pending_backfill: bool,
    pub disk_backfill_counter: usize,
    pub backfill_completed: bool,
    pub items_from_disk: u64,
    pub paused_wakeups: u64,
    pub checkpoint_cursors: BTreeMap<VBucketId, u64>,
}

/// Registry of replication producers, by name.
#[derive(Debug)]
pub struct TapConnMap {
    producers: Mutex<HashMap<String, TapProducer>>,
    next_token: AtomicU64,
    vbuckets: Arc<VBucketMap>,
    notifier: Arc<Notifier>,
}

impl TapConnMap {
    pub fn new(vbuckets: Arc<VBucketMap>, notifier: Arc<Notifier>) -> Self {
        Self {
            producers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            vbuckets,
            notifier,
        }
    }

    /// Registers a producer named `name`, replacing any previous connection
    /// with that name.
    pub fn new_producer(&self, name: &str) -> ConnectionToken {
        let token = ConnectionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let old = self
            .producers
            .lock()
            .unwrap()
            .insert(name.to_string(), TapProducer::new(token));
        if old.is_some() {
            info!("replication connection '{name}' reconnected");
        } else {
            info!("new replication connection '{name}'");
        }
        token
    }

    /// Marks `name` as disconnected.  Pending work for it becomes a no-op.
    pub fn disconnect(&self, name: &str) -> bool {
        match self.producers.lock().unwrap().get_mut(name) {
            Some(producer) => {
                producer.connected = false;
                info!("replication connection '{name}' disconnected");
                true
            }
            None => false,
        }
    }

    /// Forgets `name` and drops its checkpoint cursors.
    pub fn remove(&self, name: &str) -> bool {
        let Some(producer) = self.producers.lock().unwrap().remove(name) else {
            return false;
        };
        for vbucket in producer.checkpoint_cursors.keys() {
            if let Some(vb) = self.vbuckets.get(*vbucket) {
                vb.checkpoint_manager().remove_cursor(name);
            }
        }
        true
    }

    /// Marks `name` as waiting for events.
    pub fn set_paused(&self, name: &str, paused: bool) {
        if let Some(producer) = self.producers.lock().unwrap().get_mut(name) {
            producer.paused = paused;
        }
    }

    /// Removes and returns the queued events of `name`.
    pub fn drain_events(&self, name: &str) -> Vec<TapEvent> {
        match self.producers.lock().unwrap().get_mut(name) {
            Some(producer) => producer.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn status(&self, name: &str) -> Option<ProducerStatus> {
        self.producers
            .lock()
            .unwrap()
            .get(name)
            .map(|producer| ProducerStatus {
                connected: producer.connected,
                paused: producer.paused,
                queued_events: producer.queue.len(),
                pending_backfill: producer.pending_backfill,
                disk_backfill_counter: producer.disk_backfill_counter,
                backfill_completed: producer.backfill_completed,
                items_from_disk: producer.items_from_disk,
                paused_wakeups: producer.paused_wakeups,
                checkpoint_cursors: producer.checkpoint_cursors.clone(),
            })
    }

    /// Runs `f` on the connected producer `name`.
    fn with_connected<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut TapProducer) -> T,
    ) -> Option<T> {
        let mut producers = self.producers.lock().unwrap();
        producers
            .get_mut(name)
            .filter(|producer| producer.connected)
            .map(f)
    }

    /// Runs `f` on `name` if it is connected and still has `token`.
    fn with_token<T>(
        &self,
        name: &str,
        token: ConnectionToken,
        f: impl FnOnce(&mut TapProducer) -> T,
    ) -> Option<T> {
        let mut producers = self.producers.lock().unwrap();
        producers
            .get_mut(name)
            .filter(|producer| producer.connected && producer.token == token)
            .map(f)
    }
}

impl ConnectionRegistry for TapConnMap {
    fn begin_backfill(&self, name: &str) -> Option<ConnectionToken> {
        self.with_connected(name, |producer| {
            producer.pending_backfill = true;
            producer.backfill_completed = false;
            producer.token
        })
    }

    fn is_connected(&self, name: &str, token: ConnectionToken) -> bool {
        self.with_token(name, token, |_| ()).is_some()
    }

    fn perform_op(&self, name: &str, token: ConnectionToken, op: TapOp) -> bool {
        let vbucket = match &op {
            TapOp::SetCursorToCheckpointStart(vbucket) => Some(*vbucket),
            _ => None,
        };
        if self.with_token(name, token, |_| ()).is_none() {
            return false;
        }
        // Resolved before locking the producers: the checkpoint manager has
        // its own lock.
        let checkpoint_id = match vbucket {
            Some(vbucket) => match self.vbuckets.get(vbucket) {
                Some(vb) => Some(vb.checkpoint_manager().set_cursor_to_open_checkpoint(name)),
                None => return false,
            },
            None => None,
        };

        let mut wake = false;
        let done = self.with_token(name, token, |producer| match op {
            TapOp::ReceivedItem(item) => {
                producer.items_from_disk += 1;
                producer.queue.push_back(TapEvent::Mutation(item));
            }
            TapOp::NotifyPaused => {
                if producer.paused {
                    producer.paused = false;
                    producer.paused_wakeups += 1;
                    wake = true;
                }
            }
            TapOp::ScheduleDiskBackfill => producer.disk_backfill_counter += 1,
            TapOp::CompleteDiskBackfill => {
                if producer.disk_backfill_counter == 0 {
                    warn!("connection '{name}' completed more disk backfills than it scheduled");
                } else {
                    producer.disk_backfill_counter -= 1;
                }
            }
            TapOp::SetCursorToCheckpointStart(vbucket) => {
                if let Some(checkpoint_id) = checkpoint_id {
                    producer.checkpoint_cursors.insert(vbucket, checkpoint_id);
                }
            }
            TapOp::CompleteBackfill => producer.pending_backfill = false,
        });
        if wake {
            self.notifier.notify();
        }
        done.is_some()
    }

    fn backfill_queue_depth(&self, name: &str) -> i64 {
        self.with_connected(name, |producer| producer.queue.len() as i64)
            .unwrap_or(-1)
    }

    fn set_events(&self, name: &str, token: ConnectionToken, items: Vec<QueuedItem>) -> bool {
        let n = items.len();
        let queued = self
            .with_token(name, token, |producer| {
                producer
                    .queue
                    .extend(items.into_iter().map(TapEvent::Mutation));
            })
            .is_some();
        if queued {
            debug!("queued {n} backfill items for '{name}'");
            self.notifier.notify();
        }
        queued
    }

    fn check_backfill_completion(&self, name: &str, token: ConnectionToken) -> bool {
        let completed = self
            .with_token(name, token, |producer| {
                if producer.backfill_completed
                    || producer.pending_backfill
                    || producer.disk_backfill_counter > 0
                {
                    return false;
                }
                producer.backfill_completed = true;
                producer.queue.push_back(TapEvent::BackfillComplete);
                true
            })
            .unwrap_or(false);
        if completed {
            info!("backfill for '{name}' is complete");
        }
        completed
    }
}

#[cfg(test)]
mod test {
    use super::{ConnectionRegistry, Notifier, TapConnMap, TapEvent, TapOp};
    use crate::stats::EpStats;
    use crate::vbucket::{VBucket, VBucketMap};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use vbstore_types::config::CheckpointConfig;
    use vbstore_types::{QueuedItem, VBucketState};

    fn conn_map() -> (TapConnMap, Arc<VBucketMap>, Arc<Notifier>) {
        let vbuckets = Arc::new(VBucketMap::new());
        let notifier = Arc::new(Notifier::new());
        (
            TapConnMap::new(vbuckets.clone(), notifier.clone()),
            vbuckets,
            notifier,
        )
    }

    #[test]
    fn completion_fires_once() {
        let (map, _, _) = conn_map();
        let token = map.new_producer("replica");
        assert_eq!(map.begin_backfill("replica"), Some(token));

        assert!(map.perform_op("replica", token, TapOp::ScheduleDiskBackfill));
        assert!(map.perform_op("replica", token, TapOp::ScheduleDiskBackfill));
        assert!(map.perform_op("replica", token, TapOp::CompleteBackfill));
        assert!(!map.check_backfill_completion("replica", token));

        assert!(map.perform_op("replica", token, TapOp::CompleteDiskBackfill));
        assert!(!map.check_backfill_completion("replica", token));
        assert!(map.perform_op("replica", token, TapOp::CompleteDiskBackfill));
        assert!(map.check_backfill_completion("replica", token));
        assert!(!map.check_backfill_completion("replica", token));

        assert_eq!(map.drain_events("replica"), vec![TapEvent::BackfillComplete]);
    }

    #[test]
    fn reconnect_invalidates_token() {
        let (map, _, _) = conn_map();
        let old = map.new_producer("replica");
        assert!(map.is_connected("replica", old));
        let new = map.new_producer("replica");
        assert!(!map.is_connected("replica", old));
        assert!(map.is_connected("replica", new));

        map.disconnect("replica");
        assert!(!map.is_connected("replica", new));
        assert_eq!(map.backfill_queue_depth("replica"), -1);
        let items = vec![QueuedItem::key_only("k", 0, 1)];
        assert!(!map.set_events("replica", new, items));
        assert!(!map.perform_op("replica", new, TapOp::CompleteBackfill));
        assert_eq!(map.backfill_queue_depth("nobody"), -1);
    }

    #[test]
    fn stale_token_ops_are_ignored() {
        let (map, _, _) = conn_map();
        let old = map.new_producer("replica");
        let new = map.new_producer("replica");
        assert_eq!(map.begin_backfill("replica"), Some(new));
        assert!(map.perform_op("replica", new, TapOp::ScheduleDiskBackfill));
        assert!(map.perform_op("replica", new, TapOp::CompleteBackfill));

        assert!(!map.perform_op("replica", old, TapOp::CompleteDiskBackfill));
        assert!(!map.perform_op("replica", old, TapOp::ScheduleDiskBackfill));
        assert!(!map.set_events("replica", old, vec![QueuedItem::key_only("k", 0, 1)]));
        assert!(!map.check_backfill_completion("replica", old));
        assert!(!map.check_backfill_completion("replica", new));

        let status = map.status("replica").unwrap();
        assert_eq!(status.disk_backfill_counter, 1);
        assert_eq!(status.queued_events, 0);

        assert!(map.perform_op("replica", new, TapOp::CompleteDiskBackfill));
        assert!(map.check_backfill_completion("replica", new));
    }

    #[test]
    fn events_and_wakeups() {
        let (map, _, notifier) = conn_map();
        let token = map.new_producer("replica");
        assert!(map.set_events(
            "replica",
            token,
            vec![QueuedItem::key_only("a", 0, 1), QueuedItem::key_only("b", 0, 2)]
        ));
        assert_eq!(map.backfill_queue_depth("replica"), 2);
        assert_eq!(notifier.wakeups(), 1);

        // Only a paused connection is woken.
        map.perform_op("replica", token, TapOp::NotifyPaused);
        assert_eq!(notifier.wakeups(), 1);
        map.set_paused("replica", true);
        map.perform_op("replica", token, TapOp::NotifyPaused);
        assert_eq!(notifier.wakeups(), 2);
        let status = map.status("replica").unwrap();
        assert!(!status.paused);
        assert_eq!(status.paused_wakeups, 1);
    }

    #[test]
    fn cursor_rewind() {
        let (map, vbuckets, _) = conn_map();
        let vb = Arc::new(VBucket::new(
            4,
            VBucketState::Active,
            Arc::new(EpStats::default()),
            &CheckpointConfig::default(),
            VBucketState::Active,
            5,
        ));
        vbuckets.insert(vb.clone());
        let token = map.new_producer("replica");

        assert!(!map.perform_op("replica", token, TapOp::SetCursorToCheckpointStart(9)));
        assert!(map.perform_op("replica", token, TapOp::SetCursorToCheckpointStart(4)));
        assert!(vb.checkpoint_manager().has_cursor("replica"));
        assert_eq!(
            map.status("replica").unwrap().checkpoint_cursors.get(&4),
            Some(&5)
        );

        assert!(map.remove("replica"));
        assert!(!vb.checkpoint_manager().has_cursor("replica"));
    }
}
