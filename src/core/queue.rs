use std::sync::Arc;

use crate::core::domain::Job;
use crate::core::error::TaskError;
use crate::core::store::TaskStore;

/// Priority-queue view over the store. Enqueue writes through; dequeue is
/// the store's atomic claim, so single assignment and Critical > High >
/// Normal > Low ordering are inherited rather than re-implemented here.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<TaskStore>,
}

impl JobQueue {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    pub fn enqueue(&self, job: Job) -> Result<String, TaskError> {
        self.store.push(job)
    }

    /// Claim the best Pending job, or None when nothing is eligible.
    /// A persistence failure during the claim is surfaced as None after
    /// logging; workers treat it like an empty queue and retry later.
    pub fn dequeue(&self) -> Option<Job> {
        match self.store.pop() {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "dequeue failed to persist claim");
                None
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.store.pending_count()
    }
}
