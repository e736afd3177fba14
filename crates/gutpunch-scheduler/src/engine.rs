use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gutpunch_core::config::{
    SchedulerConfig, DEFAULT_MAX_RETRIES, DEFAULT_MAX_WORKERS, DEFAULT_POLL_INTERVAL_MS,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    dispatcher::QueueDispatcher,
    error::{Result, SchedulerError},
    executor::Executor,
    jobs::JobRepository,
    queues::QueueRepository,
    registry::{HandlerRegistry, JobHandler},
    schedule::{Delay, Schedule},
    storage::{Filter, Gateway},
    types::{Job, JobId, JobUpdate, NewJob, Parameters, QueueId, TickReport},
};

/// Runtime knobs for [`SchedulerEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    /// Upper bound on concurrently running handlers. Values below 1 act as 1.
    pub max_workers: usize,
    /// Per-job deadline. `None` lets handlers run for as long as they need.
    pub job_timeout: Option<Duration>,
    /// `max_retries` given to jobs that don't set their own.
    pub default_max_retries: u32,
    /// Minimum time a FAILED job waits before it is requeued.
    pub retry_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_workers: DEFAULT_MAX_WORKERS,
            job_timeout: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::ZERO,
        }
    }
}

impl From<&SchedulerConfig> for EngineSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            max_workers: cfg.max_workers,
            job_timeout: cfg.job_timeout(),
            default_max_retries: cfg.default_max_retries,
            retry_delay: cfg.retry_delay(),
        }
    }
}

/// Where and when a new job lands.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub schedule: Schedule,
    pub queue_id: Option<QueueId>,
    /// Overrides [`EngineSettings::default_max_retries`].
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn now() -> Self {
        Self::default()
    }

    pub fn after(delay: impl Into<Delay>) -> Self {
        Self {
            schedule: Schedule::In(delay.into()),
            ..Default::default()
        }
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            schedule: Schedule::At(instant),
            ..Default::default()
        }
    }

    pub fn in_queue(mut self, queue_id: QueueId) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Owned handle to a running poll loop. See [`SchedulerEngine::start`].
pub struct PollHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Signal the loop to stop and wait for the in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!("poll loop task failed: {e}");
        }
    }
}

/// Core scheduler: owns the handler registry, creates jobs and drives the
/// poll-dispatch cycle against the shared [`Gateway`].
pub struct SchedulerEngine {
    gateway: Arc<Gateway>,
    jobs: JobRepository,
    queues: QueueRepository,
    registry: Arc<HandlerRegistry>,
    executor: Arc<Executor>,
    settings: EngineSettings,
    ticking: AtomicBool,
}

impl SchedulerEngine {
    pub fn new(gateway: Arc<Gateway>, settings: EngineSettings) -> Self {
        let jobs = JobRepository::new(Arc::clone(&gateway));
        let queues = QueueRepository::new(Arc::clone(&gateway));
        let registry = Arc::new(HandlerRegistry::new());
        let executor = Arc::new(Executor::new(
            jobs.clone(),
            Arc::clone(&registry),
            settings.max_workers,
            settings.job_timeout,
        ));
        Self {
            gateway,
            jobs,
            queues,
            registry,
            executor,
            settings,
            ticking: AtomicBool::new(false),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.jobs
    }

    pub fn queues(&self) -> &QueueRepository {
        &self.queues
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // --- handlers ------------------------------------------------------------

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> bool {
        self.registry.register(name, handler)
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    pub fn clear_handlers(&self) {
        self.registry.clear_all();
    }

    // --- job creation --------------------------------------------------------

    /// Insert a PENDING job for `name`. The handler does not need to exist
    /// yet; it only has to be registered by the time the job is dispatched.
    #[instrument(skip(self, parameters, options), fields(queue_id = ?options.queue_id))]
    pub fn enqueue(&self, name: &str, parameters: Parameters, options: EnqueueOptions) -> Result<Job> {
        if let Some(queue_id) = options.queue_id {
            if self.queues.get_single(queue_id)?.is_none() {
                return Err(SchedulerError::QueueNotFound {
                    name: queue_id.to_string(),
                });
            }
        }

        let scheduled_time = options.schedule.resolve(self.gateway.clock().now())?;
        let job = self.jobs.create(NewJob {
            job_name: name.to_string(),
            parameters,
            scheduled_time,
            queue_id: options.queue_id,
            max_retries: options
                .max_retries
                .unwrap_or(self.settings.default_max_retries),
        })?;

        if let Some(queue_id) = job.queue_id {
            self.queues.adjust_enqueued(queue_id, 1)?;
        }
        info!(job_id = %job.job_id, scheduled_time = %job.scheduled_time, "job enqueued");
        Ok(job)
    }

    /// Register `handler` under `name` and enqueue a job due immediately.
    /// `Ok(None)` when registration was refused.
    pub fn perform_now(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        parameters: Parameters,
    ) -> Result<Option<Job>> {
        self.perform(name, handler, parameters, Schedule::Now)
    }

    /// Like [`perform_now`](Self::perform_now), due once `delay` has elapsed.
    pub fn perform_in(
        &self,
        delay: impl Into<Delay>,
        name: &str,
        handler: Arc<dyn JobHandler>,
        parameters: Parameters,
    ) -> Result<Option<Job>> {
        self.perform(name, handler, parameters, Schedule::In(delay.into()))
    }

    /// Like [`perform_now`](Self::perform_now), due at `instant`. Past
    /// instants run on the next tick.
    pub fn perform_at(
        &self,
        instant: DateTime<Utc>,
        name: &str,
        handler: Arc<dyn JobHandler>,
        parameters: Parameters,
    ) -> Result<Option<Job>> {
        self.perform(name, handler, parameters, Schedule::At(instant))
    }

    fn perform(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        parameters: Parameters,
        schedule: Schedule,
    ) -> Result<Option<Job>> {
        if !self.register_handler(name, handler) {
            warn!(job_name = name, "handler registration failed; job not created");
            return Ok(None);
        }
        let options = EnqueueOptions {
            schedule,
            ..Default::default()
        };
        self.enqueue(name, parameters, options).map(Some)
    }

    /// Move an existing job into the queue called `queue_name`, keeping both
    /// queues' `enqueued` counters in step.
    #[instrument(skip(self))]
    pub fn add_to_queue(&self, job_id: JobId, queue_name: &str) -> Result<Job> {
        let queue = self
            .queues
            .find_by_name(queue_name)?
            .ok_or_else(|| SchedulerError::QueueNotFound {
                name: queue_name.to_string(),
            })?;
        let job = self
            .jobs
            .get_single(job_id)?
            .ok_or(SchedulerError::JobNotFound { id: job_id.0 })?;

        if job.queue_id == Some(queue.queue_id) {
            debug!(%job_id, queue = queue_name, "job already in queue");
            return Ok(job);
        }

        self.jobs.update(
            JobUpdate {
                queue_id: Some(Some(queue.queue_id)),
                ..Default::default()
            },
            &Filter::new().eq("job_id", job_id),
        )?;
        self.queues.adjust_enqueued(queue.queue_id, 1)?;
        if let Some(previous) = job.queue_id {
            self.queues.adjust_enqueued(previous, -1)?;
        }
        info!(%job_id, queue = queue_name, "job moved to queue");

        self.jobs
            .get_single(job_id)?
            .ok_or(SchedulerError::JobNotFound { id: job_id.0 })
    }

    // --- dispatch ------------------------------------------------------------

    /// Queue-scoped dispatcher sharing this engine's registry and worker limits.
    pub fn dispatcher(&self) -> QueueDispatcher {
        QueueDispatcher::new(
            self.jobs.clone(),
            self.queues.clone(),
            Arc::clone(&self.executor),
        )
    }

    /// Run every PENDING job of `queue_name` now, ignoring `scheduled_time`.
    pub async fn process_queue_jobs(&self, queue_name: &str) -> Result<TickReport> {
        self.dispatcher().process_queue_jobs(queue_name).await
    }

    /// One poll cycle: requeue retryable failures, select due jobs and run
    /// them through the worker pool. Returns once every job has finished.
    ///
    /// If another tick is already in flight this returns at once with
    /// `skipped = true`.
    pub async fn tick(&self) -> Result<TickReport> {
        let Some(_guard) = TickGuard::acquire(&self.ticking) else {
            debug!("tick already in flight; skipped");
            return Ok(TickReport {
                skipped: true,
                ..Default::default()
            });
        };

        let now = self.gateway.clock().now();
        let requeued = self.jobs.requeue_failed(now, self.settings.retry_delay)?;
        let due = self.jobs.find_due(now)?;
        let selected = due.len();
        if selected == 0 {
            return Ok(TickReport {
                requeued,
                ..Default::default()
            });
        }

        debug!(selected, requeued, "dispatching due jobs");
        let counts = self.executor.run_batch(due).await;
        let report = TickReport {
            selected,
            completed: counts.completed,
            failed: counts.failed,
            requeued,
            skipped: false,
        };
        info!(
            selected = report.selected,
            completed = report.completed,
            failed = report.failed,
            "tick finished"
        );
        Ok(report)
    }

    /// Spawn the poll loop. The first tick runs immediately.
    pub fn start(self: &Arc<Self>) -> PollHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move { engine.run(shutdown_rx).await });
        PollHandle { shutdown_tx, task }
    }

    /// Poll loop. Ticks every `poll_interval` until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_workers = self.settings.max_workers,
            "scheduler engine started"
        );

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler tick error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Stop the poll loop, then release storage.
    pub async fn shutdown(&self, handle: PollHandle) -> Result<()> {
        handle.stop().await;
        self.gateway.close()
    }
}

/// Clears the in-flight flag when the tick ends, including on early return.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
