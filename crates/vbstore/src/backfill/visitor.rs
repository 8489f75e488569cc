use std::collections::HashSet;
use std::sync::Arc;

use ::metrics::counter;
use tracing::{debug, info, warn};
use vbstore_types::config::NonResidentPolicy;
use vbstore_types::{QueuedItem, VBucketId};

use super::{BackfillContext, DiskBackfillTask, VBucketVisitor};
use crate::dispatcher::Priority;
use crate::metrics::{BACKFILL_ITEMS_FROM_MEMORY, BACKFILL_PAUSES};
use crate::tap::{ConnectionToken, TapOp};
use crate::vbucket::{HashTableVisitor, StoredValue, VBucket, VBucketFilter};

/// Walks the vbuckets selected by a filter and queues their items for one
/// replication connection.
///
/// Items found in memory accumulate in `found` and are handed to the
/// connection as one sorted batch whenever the walk moves to the next
/// vbucket.  A vbucket whose resident ratio is below
/// `backfill_resident_threshold` is also scheduled for a disk pass, which
/// delivers the items the walk skipped.
pub struct BackfillVisitor {
    ctx: BackfillContext,
    name: String,
    token: ConnectionToken,
    filter: VBucketFilter,
    efficient_vb_dump: bool,

    /// Items collected since the last flush.
    found: Vec<(VBucketId, QueuedItem)>,

    /// Vbuckets awaiting a disk backfill task.
    vbuckets: Vec<VBucketId>,

    /// Vbucket being walked.
    current: Option<VBucketId>,
    resident_ratio_below_threshold: bool,

    /// The current vbucket gets a disk pass, so non-resident items are left
    /// to it.
    disk_pass: bool,

    valid: bool,
}

impl BackfillVisitor {
    pub fn new(
        ctx: BackfillContext,
        name: &str,
        token: ConnectionToken,
        filter: VBucketFilter,
        efficient_vb_dump: bool,
    ) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            token,
            filter,
            efficient_vb_dump,
            found: Vec::new(),
            vbuckets: Vec::new(),
            current: None,
            resident_ratio_below_threshold: false,
            disk_pass: false,
            valid: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the last visited vbucket had a resident ratio below the
    /// threshold.
    pub fn resident_ratio_below_threshold(&self) -> bool {
        self.resident_ratio_below_threshold
    }

    /// Schedules a disk backfill task for each vbucket marked for one, then
    /// flushes the items found so far.
    fn apply(&mut self) {
        for vbucket in std::mem::take(&mut self.vbuckets) {
            let streamed: HashSet<String> = self
                .found
                .iter()
                .filter(|(vb, _)| *vb == vbucket)
                .map(|(_, item)| item.key().to_string())
                .collect();
            let task = DiskBackfillTask::new(
                self.ctx.clone(),
                &self.name,
                self.token,
                vbucket,
                streamed,
            );
            self.ctx
                .dispatcher
                .schedule(Box::new(task), Priority::TapBgFetcher);
        }
        self.set_events();
    }

    fn set_events(&mut self) {
        if !self.check_validity() {
            self.found.clear();
            return;
        }
        if self.found.is_empty() {
            return;
        }

        let mut found = std::mem::take(&mut self.found);
        found.sort_by(|(a_vb, a), (b_vb, b)| {
            a_vb.cmp(b_vb).then_with(|| a.key().cmp(b.key()))
        });
        let items: Vec<QueuedItem> = found.into_iter().map(|(_, item)| item).collect();
        let n = items.len();
        if self.ctx.registry.set_events(&self.name, self.token, items) {
            self.ctx.stats.backfill_items_from_memory.incr(n);
            counter!(BACKFILL_ITEMS_FROM_MEMORY).increment(n as u64);
        }
    }

    fn check_validity(&mut self) -> bool {
        if self.valid {
            self.valid = self.ctx.registry.is_connected(&self.name, self.token);
            if !self.valid {
                warn!(
                    "backfilling connectivity for '{}' went invalid, stopping backfill",
                    self.name
                );
            }
        }
        self.valid
    }
}

impl HashTableVisitor for BackfillVisitor {
    fn visit(&mut self, value: &StoredValue) {
        let Some(vbucket) = self.current else {
            return;
        };
        let omit_non_resident =
            self.disk_pass || self.ctx.config.backfill_non_resident == NonResidentPolicy::Omit;
        if !value.is_resident() && omit_non_resident {
            return;
        }
        self.found.push((
            vbucket,
            QueuedItem::key_only(value.key(), vbucket, value.row_id()),
        ));
    }
}

impl VBucketVisitor for BackfillVisitor {
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool {
        self.apply();
        self.current = None;
        self.disk_pass = false;

        let id = vb.id();
        if !self.filter.accepts(id) {
            return false;
        }
        let num_items = vb.hash_table().num_items();
        if num_items == 0 {
            return false;
        }
        let non_resident = vb.hash_table().num_non_resident_items();
        let resident_ratio = (num_items - non_resident) as f64 / num_items as f64;
        self.resident_ratio_below_threshold =
            resident_ratio < self.ctx.config.backfill_resident_threshold;

        if self.efficient_vb_dump && self.resident_ratio_below_threshold {
            debug!(
                "vbucket {id} is {:.0}% resident, scheduling disk backfill for '{}'",
                resident_ratio * 100.0,
                self.name
            );
            self.disk_pass = true;
            self.vbuckets.push(id);
            self.ctx
                .registry
                .perform_op(&self.name, self.token, TapOp::ScheduleDiskBackfill);
        }

        // Mutations from here on reach the connection through the
        // checkpoint stream.
        self.ctx
            .registry
            .perform_op(&self.name, self.token, TapOp::SetCursorToCheckpointStart(id));
        self.current = Some(id);
        true
    }

    fn pause_visitor(&mut self) -> bool {
        let depth = self.ctx.registry.backfill_queue_depth(&self.name);
        if depth < 0 || !self.check_validity() {
            debug!("backfill connection '{}' went away, stopping", self.name);
            self.valid = false;
            return false;
        }

        let too_much_backlog = depth > self.ctx.config.backfill_backlog_limit;
        let memory_too_high = self.ctx.is_memory_usage_too_high();
        if too_much_backlog || memory_too_high {
            debug!(
                "pausing backfill for '{}': queue depth {depth}, memory pressure {memory_too_high}",
                self.name
            );
            self.ctx.stats.backfill_pauses.incr(1);
            counter!(BACKFILL_PAUSES).increment(1);
            return true;
        }
        false
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn complete(&mut self) {
        self.apply();
        self.ctx
            .registry
            .perform_op(&self.name, self.token, TapOp::CompleteBackfill);
        info!("in-memory backfill for '{}' finished", self.name);
        if self.ctx.registry.check_backfill_completion(&self.name, self.token) {
            self.ctx.notifier.notify();
        }
    }
}
