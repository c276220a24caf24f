use crate::scheduler::QueueScheduler;
use crate::types::QueueType;
use labflow_core::{LabflowError, LabflowResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Operator-facing lifecycle control over the per-queue schedulers.
///
/// Pause and resume are idempotent. Drain is one-way unless the engine was
/// configured with `allow_drain_reset`.
pub(crate) struct QueueControl {
    schedulers: HashMap<QueueType, Arc<QueueScheduler>>,
    allow_drain_reset: bool,
}

impl QueueControl {
    pub(crate) fn new(
        schedulers: HashMap<QueueType, Arc<QueueScheduler>>,
        allow_drain_reset: bool,
    ) -> Self {
        Self {
            schedulers,
            allow_drain_reset,
        }
    }

    fn scheduler(&self, queue: QueueType) -> LabflowResult<&Arc<QueueScheduler>> {
        self.schedulers
            .get(&queue)
            .ok_or_else(|| LabflowError::Queue(format!("no scheduler for queue {queue}")))
    }

    /// Stop dispatching from a queue; in-flight jobs finish. Idempotent.
    pub(crate) async fn pause(&self, queue: QueueType) -> LabflowResult<()> {
        self.scheduler(queue)?.pause().await;
        info!(queue = %queue, "queue paused");
        Ok(())
    }

    /// Allow dispatching from a queue again. Idempotent.
    pub(crate) async fn resume(&self, queue: QueueType) -> LabflowResult<()> {
        self.scheduler(queue)?.resume().await;
        info!(queue = %queue, "queue resumed");
        Ok(())
    }

    /// Refuse new submissions to a queue while letting existing work finish.
    pub(crate) async fn drain(&self, queue: QueueType) -> LabflowResult<()> {
        self.scheduler(queue)?.drain().await;
        info!(queue = %queue, "queue draining");
        Ok(())
    }

    /// Clear a queue's draining flag. Only available when the engine was
    /// configured to allow it.
    pub(crate) async fn reset_drain(&self, queue: QueueType) -> LabflowResult<()> {
        if !self.allow_drain_reset {
            return Err(LabflowError::InvalidRequest(
                "drain reset is disabled; drain is one-way under the current configuration"
                    .to_string(),
            ));
        }
        self.scheduler(queue)?.reset_drain().await;
        info!(queue = %queue, "queue drain reset");
        Ok(())
    }
}
