use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Result, SchedulerError},
    storage::{Filter, Gateway, Table},
    time::{format_scheduled, format_timestamp, parse_scheduled, truncate_to_seconds},
    types::{Job, JobId, JobStatus, JobUpdate, NewJob, QueueId},
};

const DUE_SQL: &str = "SELECT job_id, queue_id, job_name, parameters, status, scheduled_time,
        retries, max_retries, started_at, completed_at, created_at, updated_at
     FROM jobs
     WHERE status = ?1 AND retries < max_retries AND scheduled_time <= ?2
     ORDER BY scheduled_time ASC, job_id ASC";

const QUEUE_PENDING_SQL: &str = "SELECT job_id, queue_id, job_name, parameters, status,
        scheduled_time, retries, max_retries, started_at, completed_at, created_at, updated_at
     FROM jobs
     WHERE queue_id = ?1 AND status = ?2 AND retries < max_retries
     ORDER BY scheduled_time ASC, job_id ASC";

// One statement: no reader ever sees the status flipped without the retry
// counted or the error recorded.
const FAIL_SQL: &str = "UPDATE jobs
     SET status = CASE WHEN retries + 1 >= max_retries THEN ?1 ELSE ?2 END,
         retries = retries + 1,
         parameters = json_set(CASE WHEN json_valid(parameters) THEN parameters ELSE '{}' END,
                               '$.error', ?3),
         updated_at = ?4
     WHERE job_id = ?5 AND status = ?6";

const REQUEUE_SQL: &str = "UPDATE jobs
     SET status = ?1, updated_at = ?2
     WHERE status = ?3 AND retries < max_retries AND updated_at <= ?4";

/// Typed access to the `jobs` table.
#[derive(Clone)]
pub struct JobRepository {
    gateway: Arc<Gateway>,
}

impl JobRepository {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Insert a PENDING job with zero retries and return the stored row.
    #[instrument(skip(self, job), fields(job_name = %job.job_name))]
    pub fn create(&self, job: NewJob) -> Result<Job> {
        let now = self.gateway.clock().timestamp();
        let parameters = serde_json::to_string(&job.parameters)?;
        let id = self.gateway.insert(
            Table::Jobs,
            &[
                ("queue_id", job.queue_id.map_or(Value::Null, Value::from)),
                ("job_name", Value::Text(job.job_name.clone())),
                ("parameters", Value::Text(parameters)),
                ("status", JobStatus::Pending.into()),
                ("scheduled_time", Value::Text(format_scheduled(job.scheduled_time))),
                ("retries", Value::Integer(0)),
                ("max_retries", Value::Integer(job.max_retries as i64)),
                ("created_at", Value::Text(now.clone())),
                ("updated_at", Value::Text(now)),
            ],
        )?;
        info!(job_id = id, "job created");
        self.get_single(JobId(id))?
            .ok_or(SchedulerError::JobNotFound { id })
    }

    pub fn get_single(&self, id: JobId) -> Result<Option<Job>> {
        self.gateway
            .select_one(Table::Jobs, &Filter::new().eq("job_id", id), row_to_job)
    }

    /// Jobs matching every equality in `filter`, oldest first.
    pub fn get_jobs(&self, filter: &Filter) -> Result<Vec<Job>> {
        self.gateway.select(Table::Jobs, filter, &["job_id"], row_to_job)
    }

    /// Partial update of every row matching `filter`. Always refreshes `updated_at`.
    pub fn update(&self, data: JobUpdate, filter: &Filter) -> Result<usize> {
        let mut set: Vec<(&str, Value)> = Vec::new();
        if let Some(queue_id) = data.queue_id {
            set.push(("queue_id", queue_id.map_or(Value::Null, Value::from)));
        }
        if let Some(name) = data.job_name {
            set.push(("job_name", Value::Text(name)));
        }
        if let Some(params) = data.parameters {
            set.push(("parameters", Value::Text(serde_json::to_string(&params)?)));
        }
        if let Some(status) = data.status {
            set.push(("status", status.into()));
        }
        if let Some(at) = data.scheduled_time {
            set.push(("scheduled_time", Value::Text(format_scheduled(at))));
        }
        if let Some(retries) = data.retries {
            set.push(("retries", Value::Integer(retries as i64)));
        }
        if let Some(max) = data.max_retries {
            set.push(("max_retries", Value::Integer(max as i64)));
        }
        set.push(("updated_at", Value::Text(self.gateway.clock().timestamp())));
        self.gateway.update(Table::Jobs, &set, filter)
    }

    /// Jobs the poll tick should dispatch at `now`, earliest first.
    pub fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let bound = format_scheduled(truncate_to_seconds(now));
        self.gateway.query_raw(
            DUE_SQL,
            &[JobStatus::Pending.into(), Value::Text(bound)],
            row_to_job,
        )
    }

    /// PENDING jobs of one queue regardless of `scheduled_time`.
    pub fn find_pending_in_queue(&self, queue_id: QueueId) -> Result<Vec<Job>> {
        self.gateway.query_raw(
            QUEUE_PENDING_SQL,
            &[queue_id.into(), JobStatus::Pending.into()],
            row_to_job,
        )
    }

    /// PENDING → RUNNING. Returns false if the row was not PENDING.
    pub fn mark_running(&self, id: JobId) -> Result<bool> {
        let now = self.gateway.clock().timestamp();
        let n = self.gateway.update(
            Table::Jobs,
            &[
                ("status", JobStatus::Running.into()),
                ("started_at", Value::Text(now.clone())),
                ("updated_at", Value::Text(now)),
            ],
            &Filter::new()
                .eq("job_id", id)
                .eq("status", JobStatus::Pending),
        )?;
        Ok(n == 1)
    }

    /// RUNNING → COMPLETED. Returns false if the row was not RUNNING.
    pub fn mark_completed(&self, id: JobId) -> Result<bool> {
        let now = self.gateway.clock().timestamp();
        let n = self.gateway.update(
            Table::Jobs,
            &[
                ("status", JobStatus::Completed.into()),
                ("completed_at", Value::Text(now.clone())),
                ("updated_at", Value::Text(now)),
            ],
            &Filter::new()
                .eq("job_id", id)
                .eq("status", JobStatus::Running),
        )?;
        Ok(n == 1)
    }

    /// Unconditionally put a job back to PENDING.
    pub fn mark_pending(&self, id: JobId) -> Result<bool> {
        self.set_status(id, JobStatus::Pending)
    }

    /// Unconditionally retire a job.
    pub fn mark_dead(&self, id: JobId) -> Result<bool> {
        self.set_status(id, JobStatus::Dead)
    }

    fn set_status(&self, id: JobId, status: JobStatus) -> Result<bool> {
        let n = self.update(
            JobUpdate {
                status: Some(status),
                ..Default::default()
            },
            &Filter::new().eq("job_id", id),
        )?;
        Ok(n == 1)
    }

    /// Record a failed attempt in one statement: bump `retries`, store the
    /// message under `parameters.error`, and land in FAILED, or DEAD when
    /// this attempt used up the last retry.
    ///
    /// Only applies while the row is still in `from` (PENDING for a job that
    /// was never claimed, RUNNING for one whose handler ran). Returns false
    /// when another dispatcher already moved it on.
    pub fn mark_failed(&self, id: JobId, from: JobStatus, message: &str) -> Result<bool> {
        let now = self.gateway.clock().timestamp();
        let n = self.gateway.execute_raw(
            FAIL_SQL,
            &[
                JobStatus::Dead.into(),
                JobStatus::Failed.into(),
                Value::Text(message.to_string()),
                Value::Text(now),
                id.into(),
                from.into(),
            ],
        )?;
        if n == 1 {
            warn!(job_id = %id, error = message, "job attempt failed");
        }
        Ok(n == 1)
    }

    /// FAILED → PENDING for every job that still has retries left and has
    /// waited at least `delay` since it failed.
    pub fn requeue_failed(&self, now: DateTime<Utc>, delay: Duration) -> Result<usize> {
        let cutoff = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let n = self.gateway.execute_raw(
            REQUEUE_SQL,
            &[
                JobStatus::Pending.into(),
                Value::Text(self.gateway.clock().timestamp()),
                JobStatus::Failed.into(),
                Value::Text(format_timestamp(cutoff)),
            ],
        )?;
        if n > 0 {
            debug!(count = n, "failed jobs requeued for retry");
        }
        Ok(n)
    }

    /// Number of jobs in each status. Statuses with no jobs are omitted.
    pub fn count_by_status(&self) -> Result<HashMap<JobStatus, usize>> {
        let rows: Vec<(JobStatus, i64)> = self.gateway.query_raw(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
            &[],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(rows
            .into_iter()
            .map(|(status, n)| (status, n as usize))
            .collect())
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let scheduled: String = row.get("scheduled_time")?;
    let scheduled_time = parse_scheduled(&scheduled).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("bad scheduled_time: {scheduled}").into(),
        )
    })?;
    Ok(Job {
        job_id: row.get("job_id")?,
        queue_id: row.get("queue_id")?,
        job_name: row.get("job_name")?,
        parameters: row.get("parameters")?,
        status: row.get("status")?,
        scheduled_time,
        retries: row.get("retries")?,
        max_retries: row.get("max_retries")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
