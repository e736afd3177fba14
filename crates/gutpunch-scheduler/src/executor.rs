use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::{
    jobs::JobRepository,
    registry::HandlerRegistry,
    types::{Job, JobStatus},
};

/// What happened to one dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
    /// Another dispatcher claimed the row first, or storage refused the claim.
    Skipped,
}

/// Counts from one batch.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BatchCounts {
    pub completed: usize,
    pub failed: usize,
}

/// Runs jobs through their handlers, at most `max_workers` at a time.
///
/// Shared by the poll tick and the queue dispatcher so both apply the same
/// claim / execute / record sequence.
pub(crate) struct Executor {
    jobs: JobRepository,
    registry: Arc<HandlerRegistry>,
    max_workers: usize,
    job_timeout: Option<Duration>,
}

impl Executor {
    pub fn new(
        jobs: JobRepository,
        registry: Arc<HandlerRegistry>,
        max_workers: usize,
        job_timeout: Option<Duration>,
    ) -> Self {
        Self {
            jobs,
            registry,
            max_workers: max_workers.max(1),
            job_timeout,
        }
    }

    /// Execute `batch` and wait for every job to finish.
    ///
    /// Permits are acquired in batch order, so jobs start in the order they
    /// were selected even though up to `max_workers` run at once.
    pub async fn run_batch(self: &Arc<Self>, batch: Vec<Job>) -> BatchCounts {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut running = JoinSet::new();

        for job in batch {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = Arc::clone(self);
            running.spawn(async move {
                let _permit = permit;
                executor.execute(job).await
            });
        }

        let mut counts = BatchCounts::default();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Outcome::Completed) => counts.completed += 1,
                Ok(Outcome::Failed) => counts.failed += 1,
                Ok(Outcome::Skipped) => {}
                Err(e) => error!("dispatch task aborted: {e}"),
            }
        }
        counts
    }

    /// Claim, run and record one job. Never returns an error: every failure
    /// is either written to the job row or logged.
    pub async fn execute(&self, job: Job) -> Outcome {
        let Some(handler) = self.registry.get(&job.job_name) else {
            let message = format!("No handler registered for job type: {}", job.job_name);
            error!(job_id = %job.job_id, job_name = %job.job_name, "{message}");
            return self.fail(&job, JobStatus::Pending, &message);
        };

        match self.jobs.mark_running(job.job_id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.job_id, "job no longer pending; skipped");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(job_id = %job.job_id, "could not mark job running: {e}");
                return Outcome::Skipped;
            }
        }

        let parameters = match job.parameters() {
            Ok(p) => p,
            Err(e) => return self.fail(&job, JobStatus::Running, &format!("invalid parameters: {e}")),
        };

        debug!(job_id = %job.job_id, job_name = %job.job_name, attempt = job.retries + 1, "executing job");

        // Own task per handler: a panic surfaces as a JoinError instead of
        // unwinding through the batch.
        let task = tokio::spawn(async move { handler.handle(parameters).await });
        let joined = match self.job_timeout {
            Some(limit) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        let message = format!("handler timed out after {}ms", limit.as_millis());
                        return self.fail(&job, JobStatus::Running, &message);
                    }
                }
            }
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => match self.jobs.mark_completed(job.job_id) {
                Ok(true) => {
                    info!(job_id = %job.job_id, job_name = %job.job_name, "job completed");
                    Outcome::Completed
                }
                Ok(false) => {
                    debug!(job_id = %job.job_id, "job left RUNNING elsewhere; completion not recorded");
                    Outcome::Skipped
                }
                Err(e) => {
                    error!(job_id = %job.job_id, "could not mark job completed: {e}");
                    Outcome::Skipped
                }
            },
            Ok(Err(e)) => self.fail(&job, JobStatus::Running, &format!("{e:#}")),
            Err(e) if e.is_panic() => {
                let message = format!("handler panicked: {}", panic_message(e.into_panic()));
                self.fail(&job, JobStatus::Running, &message)
            }
            Err(_) => self.fail(&job, JobStatus::Running, "handler task cancelled"),
        }
    }

    /// Failure write guarded on `from`. A lost guard means another
    /// dispatcher already recorded this attempt, so the job is skipped.
    fn fail(&self, job: &Job, from: JobStatus, message: &str) -> Outcome {
        match self.jobs.mark_failed(job.job_id, from, message) {
            Ok(true) => Outcome::Failed,
            Ok(false) => {
                debug!(job_id = %job.job_id, expected = %from, "job already moved on; failure not recorded");
                Outcome::Skipped
            }
            Err(e) => {
                error!(job_id = %job.job_id, "could not record job failure: {e}");
                Outcome::Skipped
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
