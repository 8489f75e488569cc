use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use vbstore_types::VBucketId;

use super::VBucketVisitor;
use crate::dispatcher::{Task, TaskResult};
use crate::vbucket::VBucketMap;

/// Runs a [`VBucketVisitor`] over all vbuckets, one vbucket per invocation.
///
/// The vbucket ids are captured when the driver is created; vbuckets deleted
/// since are skipped.  The driver snoozes for `pause_delay` whenever the
/// visitor asks to pause, and stops without completing the visitor once it
/// turns invalid.
pub struct BackfillDriver<V> {
    vbuckets: Arc<VBucketMap>,
    pending: VecDeque<VBucketId>,
    visitor: V,
    pause_delay: Duration,
    description: String,
}

impl<V: VBucketVisitor> BackfillDriver<V> {
    pub fn new(
        vbuckets: Arc<VBucketMap>,
        visitor: V,
        pause_delay: Duration,
        description: impl Into<String>,
    ) -> Self {
        let pending = vbuckets.ids().into();
        Self {
            vbuckets,
            pending,
            visitor,
            pause_delay,
            description: description.into(),
        }
    }

    pub fn visitor(&self) -> &V {
        &self.visitor
    }
}

impl<V: VBucketVisitor> Task for BackfillDriver<V> {
    fn run(&mut self) -> TaskResult {
        if let Some(&id) = self.pending.front() {
            if let Some(vb) = self.vbuckets.get(id) {
                if self.visitor.pause_visitor() {
                    return TaskResult::Snooze(self.pause_delay);
                }
                if !self.visitor.is_valid() {
                    info!("{}: visitor went invalid, stopping", self.description);
                    self.pending.clear();
                    return TaskResult::Done;
                }
                if self.visitor.visit_bucket(&vb) {
                    vb.hash_table().visit(&mut self.visitor);
                }
            }
            self.pending.pop_front();
        }

        if self.pending.is_empty() {
            self.visitor.complete();
            TaskResult::Done
        } else {
            TaskResult::Reschedule
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}
