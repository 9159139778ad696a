//! Side effects gathered inside a transaction and released after commit.

use tillkeeper_core::LabelRequest;

use crate::cache::InvalidationBatch;
use crate::pool::Hooks;

/// Everything a transaction wants to tell the outside world.
///
/// Dropped untouched when the transaction rolls back, so a failed operation
/// never invalidates cache keys or prints labels.
#[derive(Debug)]
pub(crate) struct Effects<'h> {
    pub hooks: &'h Hooks,
    pub batch: InvalidationBatch,
    pub labels: Vec<LabelRequest>,
}

impl<'h> Effects<'h> {
    pub fn new(hooks: &'h Hooks) -> Self {
        Effects {
            hooks,
            batch: InvalidationBatch::new(),
            labels: Vec::new(),
        }
    }

    /// Call after commit.
    pub fn release(self) {
        self.release_if(true);
    }

    /// Call after commit; `notify_cache = false` skips cache notices only.
    pub fn release_if(self, notify_cache: bool) {
        let Effects {
            hooks,
            batch,
            labels,
        } = self;
        if !labels.is_empty() {
            hooks.labels.submit_all(labels);
        }
        hooks.flush_if(batch, notify_cache);
    }
}
