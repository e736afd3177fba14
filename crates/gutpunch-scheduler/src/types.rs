use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Structured job payload handed to handlers.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Reserved parameters key the failure transition writes the error message into.
pub const ERROR_KEY: &str = "error";

/// Storage-assigned primary key of a `jobs` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

/// Storage-assigned primary key of a `queues` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub i64);

macro_rules! sql_id {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $ty {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$ty> for Value {
            fn from(id: $ty) -> Self {
                Value::Integer(id.0)
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map($ty)
            }
        }
    };
}

sql_id!(JobId);
sql_id!(QueueId);

/// Lifecycle state of a job. Persisted as the integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its scheduled_time.
    Pending,
    /// Handler is executing.
    Running,
    /// Handler returned successfully. Terminal.
    Completed,
    /// Last attempt failed; retried on a later tick while retries remain.
    Failed,
    /// Retries exhausted. Terminal.
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    pub fn code(self) -> i64 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Dead => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// The poll cycle never selects a job in a terminal state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl From<JobStatus> for Value {
    fn from(status: JobStatus) -> Self {
        Value::Integer(status.code())
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = i64::column_result(value)?;
        JobStatus::from_code(code).ok_or(FromSqlError::OutOfRange(code))
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// `None` means the job is not assigned to any queue.
    pub queue_id: Option<QueueId>,
    /// Handler registry key.
    pub job_name: String,
    /// JSON object text, exactly as stored.
    pub parameters: String,
    pub status: JobStatus,
    /// Whole-second UTC instant before which the job must not run.
    pub scheduled_time: DateTime<Utc>,
    pub retries: u32,
    pub max_retries: u32,
    /// RFC 3339 timestamp of the most recent transition to RUNNING.
    pub started_at: Option<String>,
    /// RFC 3339 timestamp of the transition to COMPLETED.
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Decode the stored payload.
    pub fn parameters(&self) -> Result<Parameters> {
        decode_parameters(&self.parameters)
    }

    /// The message recorded by the last failure, if any.
    pub fn error(&self) -> Option<String> {
        let params = self.parameters().ok()?;
        match params.get(ERROR_KEY)? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Whether the poll predicate would select this job at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.retries < self.max_retries
            && self.scheduled_time <= crate::time::truncate_to_seconds(now)
    }
}

/// Decode a parameters column. An empty column decodes to an empty object.
pub fn decode_parameters(raw: &str) -> Result<Parameters> {
    if raw.trim().is_empty() {
        return Ok(Parameters::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Insert payload for a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_name: String,
    pub parameters: Parameters,
    pub scheduled_time: DateTime<Utc>,
    pub queue_id: Option<QueueId>,
    pub max_retries: u32,
}

/// Partial update of a job row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// `Some(None)` clears the queue assignment.
    pub queue_id: Option<Option<QueueId>>,
    pub job_name: Option<String>,
    pub parameters: Option<Parameters>,
    pub status: Option<JobStatus>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
    pub max_retries: Option<u32>,
}

/// A persisted queue record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub queue_id: QueueId,
    pub name: String,
    pub description: Option<String>,
    /// Lower value is dispatched first.
    pub priority: i64,
    /// Number of jobs assigned to this queue.
    pub enqueued: i64,
    /// RFC 3339 timestamp of the last assignment, if any.
    pub enqueued_at: Option<String>,
    pub created_at: String,
}

/// Insert payload for a new queue row.
#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
}

impl NewQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update of a queue row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct QueueUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<i64>,
}

/// Outcome counts of one poll tick or queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Rows matched by the selection predicate.
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
    /// FAILED rows put back to PENDING before selection.
    pub requeued: usize,
    /// True when the tick did nothing because another one was in flight.
    pub skipped: bool,
}
