use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::{
    error::{Result, SchedulerError},
    executor::Executor,
    jobs::JobRepository,
    queues::QueueRepository,
    types::TickReport,
};

/// Drains one named queue on demand.
///
/// Unlike the poll tick it ignores `scheduled_time`: every PENDING job in the
/// queue with retries left is dispatched now. Jobs go through the same
/// executor as the tick, so claim guards, the worker limit and the atomic
/// failure write all apply.
pub struct QueueDispatcher {
    jobs: JobRepository,
    queues: QueueRepository,
    executor: Arc<Executor>,
}

impl QueueDispatcher {
    pub(crate) fn new(jobs: JobRepository, queues: QueueRepository, executor: Arc<Executor>) -> Self {
        Self {
            jobs,
            queues,
            executor,
        }
    }

    #[instrument(skip(self))]
    pub async fn process_queue_jobs(&self, queue_name: &str) -> Result<TickReport> {
        let Some(queue) = self.queues.find_by_name(queue_name)? else {
            warn!(queue = queue_name, "queue not found");
            return Err(SchedulerError::QueueNotFound {
                name: queue_name.to_string(),
            });
        };

        let pending = self.jobs.find_pending_in_queue(queue.queue_id)?;
        let selected = pending.len();
        if selected == 0 {
            return Ok(TickReport::default());
        }

        let counts = self.executor.run_batch(pending).await;
        info!(
            queue = queue_name,
            selected,
            completed = counts.completed,
            failed = counts.failed,
            "queue drained"
        );
        Ok(TickReport {
            selected,
            completed: counts.completed,
            failed: counts.failed,
            ..Default::default()
        })
    }
}
