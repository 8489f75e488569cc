use std::collections::HashSet;
use std::time::Duration;

use ::metrics::counter;
use tracing::{debug, warn};
use vbstore_types::VBucketId;

use super::BackfillContext;
use crate::dispatcher::{Task, TaskResult};
use crate::metrics::{BACKFILL_ITEMS_FROM_DISK, DISK_BACKFILLS, DISK_BACKFILL_SNOOZES};
use crate::tap::{ConnectionToken, TapOp};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskBackfillState {
    /// Waiting for memory usage to drop below the backfill threshold.
    PendingMemoryCheck,
    /// Dumping the vbucket.
    Running,
    Done,
}

/// Streams the persisted items of one vbucket into a replication
/// connection's queue.
///
/// Keys the in-memory walk already queued for the connection are skipped.
/// Whatever happens, the task reports [`TapOp::CompleteDiskBackfill`] exactly
/// once, so the connection's backfill can complete.  Every operation carries
/// the token of the connection that scheduled the task, so a task outliving a
/// reconnect cannot touch the new connection's backfill.
pub struct DiskBackfillTask {
    ctx: BackfillContext,
    name: String,
    token: ConnectionToken,
    vbucket: VBucketId,
    streamed: HashSet<String>,
    state: DiskBackfillState,
}

impl DiskBackfillTask {
    pub fn new(
        ctx: BackfillContext,
        name: &str,
        token: ConnectionToken,
        vbucket: VBucketId,
        streamed: HashSet<String>,
    ) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            token,
            vbucket,
            streamed,
            state: DiskBackfillState::PendingMemoryCheck,
        }
    }

    pub fn state(&self) -> DiskBackfillState {
        self.state
    }

    /// Dumps the vbucket.  Returns false if nothing was dumped.
    fn dump(&self) -> bool {
        if !self.ctx.registry.is_connected(&self.name, self.token) {
            debug!(
                "'{}' disconnected, skipping disk backfill of vbucket {}",
                self.name, self.vbucket
            );
            return false;
        }
        if self.ctx.is_flush_all_scheduled() {
            debug!(
                "flush all is scheduled, skipping disk backfill of vbucket {}",
                self.vbucket
            );
            return false;
        }

        let registry = &self.ctx.registry;
        let mut queued = 0;
        let result = self.ctx.kvstore.dump(self.vbucket, &mut |item| {
            if self.streamed.contains(item.key()) {
                return;
            }
            if registry.perform_op(&self.name, self.token, TapOp::ReceivedItem(item)) {
                queued += 1;
            }
            registry.perform_op(&self.name, self.token, TapOp::NotifyPaused);
        });
        self.ctx.stats.backfill_items_from_disk.incr(queued);
        counter!(BACKFILL_ITEMS_FROM_DISK).increment(queued as u64);

        match result {
            Ok(()) => {
                debug!(
                    "disk backfill of vbucket {} queued {queued} items for '{}'",
                    self.vbucket, self.name
                );
                true
            }
            Err(error) => {
                warn!(
                    "disk backfill of vbucket {} for '{}' failed: {error}",
                    self.vbucket, self.name
                );
                false
            }
        }
    }
}

impl Task for DiskBackfillTask {
    fn run(&mut self) -> TaskResult {
        if self.state == DiskBackfillState::Done {
            return TaskResult::Done;
        }
        if self.ctx.is_memory_usage_too_high() {
            self.state = DiskBackfillState::PendingMemoryCheck;
            self.ctx.stats.disk_backfill_snoozes.incr(1);
            counter!(DISK_BACKFILL_SNOOZES).increment(1);
            return TaskResult::Snooze(Duration::from_secs(self.ctx.config.bg_fetch_delay_secs));
        }

        self.state = DiskBackfillState::Running;
        let dumped = self.dump();

        self.ctx
            .registry
            .perform_op(&self.name, self.token, TapOp::CompleteDiskBackfill);
        if dumped && self.ctx.registry.check_backfill_completion(&self.name, self.token) {
            self.ctx.notifier.notify();
        }
        counter!(DISK_BACKFILLS).increment(1);
        self.state = DiskBackfillState::Done;
        TaskResult::Done
    }

    fn description(&self) -> String {
        format!(
            "Loading replication backfill from disk for vbucket {}",
            self.vbucket
        )
    }
}
