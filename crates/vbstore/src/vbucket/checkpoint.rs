//! Ordered change log of a vbucket.
//!
//! Mutations are appended to the open checkpoint.  Once it holds
//! `max_items` items it is closed and a new open checkpoint, with the next
//! id, takes its place.  Named cursors track how far each consumer (the
//! flusher, replication connections) has read.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;
use vbstore_types::config::CheckpointConfig;
use vbstore_types::{QueuedItem, VBucketId};

#[derive(Debug)]
struct Checkpoint {
    id: u64,
    items: Vec<QueuedItem>,
}

/// Read position: the next item is `items[offset]` of checkpoint
/// `checkpoint_id`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Cursor {
    checkpoint_id: u64,
    offset: usize,
}

/// A position in the log returned by
/// [`CheckpointManager::items_for_cursor`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CursorPosition(Cursor);

#[derive(Debug)]
struct Inner {
    /// Oldest first.  The last checkpoint is the open one.
    checkpoints: VecDeque<Checkpoint>,
    cursors: BTreeMap<String, Cursor>,
}

impl Inner {
    fn open(&self) -> &Checkpoint {
        // Never empty: there is always an open checkpoint.
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    fn open_mut(&mut self) -> &mut Checkpoint {
        let last = self.checkpoints.len() - 1;
        &mut self.checkpoints[last]
    }

    fn open_cursor(&self) -> Cursor {
        Cursor {
            checkpoint_id: self.open().id,
            offset: 0,
        }
    }
}

#[derive(Debug)]
pub struct CheckpointManager {
    vbucket: VBucketId,
    max_items: usize,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new(vbucket: VBucketId, config: &CheckpointConfig, open_checkpoint_id: u64) -> Self {
        Self {
            vbucket,
            max_items: config.max_items.max(1),
            inner: Mutex::new(Inner {
                checkpoints: VecDeque::from([Checkpoint {
                    id: open_checkpoint_id,
                    items: Vec::new(),
                }]),
                cursors: BTreeMap::new(),
            }),
        }
    }

    pub fn open_checkpoint_id(&self) -> u64 {
        self.inner.lock().unwrap().open().id
    }

    /// Renumbers the open checkpoint.  Cursors positioned in it follow.
    pub fn set_open_checkpoint_id(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.open().id;
        inner.open_mut().id = id;
        for cursor in inner.cursors.values_mut() {
            if cursor.checkpoint_id == old {
                cursor.checkpoint_id = id;
            }
        }
    }

    /// Appends `item` to the open checkpoint, closing it if it is full.
    pub fn queue_dirty(&self, item: QueuedItem) {
        let mut inner = self.inner.lock().unwrap();
        inner.open_mut().items.push(item);
        if inner.open().items.len() >= self.max_items {
            Self::close_open_checkpoint(self.vbucket, &mut inner);
        }
    }

    /// Closes the open checkpoint and opens a new one.  Returns the new open
    /// checkpoint id.
    pub fn create_new_checkpoint(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        Self::close_open_checkpoint(self.vbucket, &mut inner)
    }

    fn close_open_checkpoint(vbucket: VBucketId, inner: &mut Inner) -> u64 {
        let id = inner.open().id + 1;
        inner.checkpoints.push_back(Checkpoint {
            id,
            items: Vec::new(),
        });
        debug!("vbucket {vbucket}: opened checkpoint {id}");
        id
    }

    /// Moves cursor `name` to the start of the open checkpoint, registering it
    /// if needed.  Returns the open checkpoint id.
    pub fn set_cursor_to_open_checkpoint(&self, name: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let cursor = inner.open_cursor();
        inner.cursors.insert(name.to_string(), cursor);
        cursor.checkpoint_id
    }

    /// Returns true if cursor `name` existed.
    pub fn remove_cursor(&self, name: &str) -> bool {
        self.inner.lock().unwrap().cursors.remove(name).is_some()
    }

    pub fn has_cursor(&self, name: &str) -> bool {
        self.inner.lock().unwrap().cursors.contains_key(name)
    }

    /// Checkpoint id the cursor is positioned in.
    pub fn cursor_checkpoint_id(&self, name: &str) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.cursors.get(name).map(|cursor| cursor.checkpoint_id)
    }

    /// Returns all items past cursor `name` and advances it to the end of the
    /// log.  An unknown cursor reads nothing.
    pub fn next_items(&self, name: &str) -> Vec<QueuedItem> {
        let (items, end) = self.items_for_cursor(name);
        if let Some(end) = end {
            self.advance_cursor(name, end);
        }
        items
    }

    /// Returns all items past cursor `name` without moving it, along with the
    /// end of the log to pass to [`advance_cursor`](Self::advance_cursor)
    /// once the items are consumed.  `None` for an unknown cursor.
    pub fn items_for_cursor(&self, name: &str) -> (Vec<QueuedItem>, Option<CursorPosition>) {
        let inner = self.inner.lock().unwrap();
        let Some(cursor) = inner.cursors.get(name).copied() else {
            return (Vec::new(), None);
        };
        let mut items = Vec::new();
        for checkpoint in &inner.checkpoints {
            if checkpoint.id < cursor.checkpoint_id {
                continue;
            }
            let skip = if checkpoint.id == cursor.checkpoint_id {
                cursor.offset
            } else {
                0
            };
            items.extend(checkpoint.items.iter().skip(skip).cloned());
        }
        let end = Cursor {
            checkpoint_id: inner.open().id,
            offset: inner.open().items.len(),
        };
        (items, Some(CursorPosition(end)))
    }

    /// Moves cursor `name` to `position`.  Does nothing if the cursor was
    /// removed meanwhile.
    pub fn advance_cursor(&self, name: &str, position: CursorPosition) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cursor) = inner.cursors.get_mut(name) {
            *cursor = position.0;
        }
    }

    /// Number of items cursor `name` has yet to read.
    pub fn num_items_for_cursor(&self, name: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        let Some(cursor) = inner.cursors.get(name) else {
            return 0;
        };
        inner
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.id >= cursor.checkpoint_id)
            .map(|checkpoint| {
                if checkpoint.id == cursor.checkpoint_id {
                    checkpoint.items.len().saturating_sub(cursor.offset)
                } else {
                    checkpoint.items.len()
                }
            })
            .sum()
    }

    /// Drops closed checkpoints that every cursor has moved past.  Returns the
    /// number of items released.
    pub fn remove_closed_unreferenced_checkpoints(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let oldest_referenced = inner
            .cursors
            .values()
            .map(|cursor| cursor.checkpoint_id)
            .min()
            .unwrap_or(inner.open().id);
        let mut released = 0;
        while inner.checkpoints.len() > 1 && inner.checkpoints[0].id < oldest_referenced {
            if let Some(checkpoint) = inner.checkpoints.pop_front() {
                released += checkpoint.items.len();
            }
        }
        released
    }

    /// Total number of items in the log.
    pub fn num_items(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.checkpoints.iter().map(|c| c.items.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::CheckpointManager;
    use pretty_assertions::assert_eq;
    use vbstore_types::config::CheckpointConfig;
    use vbstore_types::QueuedItem;

    fn keys(items: &[QueuedItem]) -> Vec<&str> {
        items.iter().map(QueuedItem::key).collect()
    }

    #[test]
    fn cursors_read_across_checkpoints() {
        let manager = CheckpointManager::new(0, &CheckpointConfig { max_items: 2 }, 1);
        manager.set_cursor_to_open_checkpoint("persistence");
        for key in ["a", "b", "c"] {
            manager.queue_dirty(QueuedItem::key_only(key, 0, -1));
        }
        assert_eq!(manager.open_checkpoint_id(), 2);
        assert_eq!(manager.num_items_for_cursor("persistence"), 3);
        assert_eq!(keys(&manager.next_items("persistence")), vec!["a", "b", "c"]);
        assert!(manager.next_items("persistence").is_empty());

        manager.queue_dirty(QueuedItem::key_only("d", 0, -1));
        assert_eq!(keys(&manager.next_items("persistence")), vec!["d"]);
        assert!(manager.next_items("unknown").is_empty());
    }

    #[test]
    fn reading_without_advancing() {
        let manager = CheckpointManager::new(0, &CheckpointConfig::default(), 1);
        manager.set_cursor_to_open_checkpoint("persistence");
        manager.queue_dirty(QueuedItem::key_only("a", 0, -1));

        let (items, end) = manager.items_for_cursor("persistence");
        assert_eq!(keys(&items), vec!["a"]);
        assert_eq!(manager.num_items_for_cursor("persistence"), 1);

        manager.queue_dirty(QueuedItem::key_only("b", 0, -1));
        manager.advance_cursor("persistence", end.unwrap());
        assert_eq!(keys(&manager.next_items("persistence")), vec!["b"]);

        assert_eq!(manager.items_for_cursor("unknown"), (Vec::new(), None));
    }

    #[test]
    fn rewind_to_open_checkpoint() {
        let manager = CheckpointManager::new(0, &CheckpointConfig { max_items: 10 }, 1);
        manager.queue_dirty(QueuedItem::key_only("old", 0, -1));
        manager.create_new_checkpoint();
        manager.queue_dirty(QueuedItem::key_only("new", 0, -1));

        assert_eq!(manager.set_cursor_to_open_checkpoint("replica"), 2);
        assert_eq!(keys(&manager.next_items("replica")), vec!["new"]);

        // Nobody references checkpoint 1 anymore.
        assert_eq!(manager.remove_closed_unreferenced_checkpoints(), 1);
        assert_eq!(manager.num_items(), 1);
    }

    #[test]
    fn renumbering_moves_cursors() {
        let manager = CheckpointManager::new(0, &CheckpointConfig::default(), 0);
        manager.set_cursor_to_open_checkpoint("c");
        manager.set_open_checkpoint_id(2);
        assert_eq!(manager.open_checkpoint_id(), 2);
        assert_eq!(manager.cursor_checkpoint_id("c"), Some(2));
        assert!(manager.has_cursor("c"));
        assert!(manager.remove_cursor("c"));
        assert!(!manager.has_cursor("c"));
    }
}
